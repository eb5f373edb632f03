//! 수신자 (클라이언트측)
//!
//! - 수신한 DATA/METADATA마다 즉시 RECEIVED 응답 (중복 포함)
//! - 시퀀스 ID 기준 중복 제거 후 싱크에 배치
//! - 수신 바이트가 METADATA의 전체 길이와 같아지면 완료

use std::collections::{BTreeMap, HashSet};
use std::io::{Seek, SeekFrom, Write};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::chunk::{chunk_offset, SeqId};
use crate::packet::Packet;
use crate::stats::TransferStats;
use crate::{Error, Result};

/// 수신 확인 패킷 생성
///
/// 중복 여부와 무관하게 DATA/METADATA에는 항상 응답함.
/// 송신측 확인 처리가 멱등이므로 중복 응답은 안전함.
pub fn acknowledgment(packet: &Packet) -> Option<Packet> {
    match packet {
        Packet::Data { seq, .. } => Some(Packet::Received { seq: *seq }),
        Packet::Metadata { .. } => Some(Packet::metadata_received()),
        _ => None,
    }
}

/// 청크 배치 대상
pub trait ChunkSink {
    /// 청크 내용을 페이로드 내 `offset` 위치에 배치
    fn place(&mut self, seq: SeqId, offset: u64, content: &[u8]) -> Result<()>;
}

/// 메모리 싱크 (카탈로그 목록 등 작은 페이로드)
///
/// ID 순으로 보관했다가 마지막에 이어붙임
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: BTreeMap<SeqId, Bytes>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// ID 순서대로 이어붙인 결과
    pub fn into_bytes(self) -> Bytes {
        let len = self.chunks.values().map(|c| c.len()).sum();
        let mut buf = BytesMut::with_capacity(len);
        for chunk in self.chunks.into_values() {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

impl ChunkSink for MemorySink {
    fn place(&mut self, seq: SeqId, _offset: u64, content: &[u8]) -> Result<()> {
        self.chunks.insert(seq, Bytes::copy_from_slice(content));
        Ok(())
    }
}

/// 임의 위치 쓰기 싱크 (파일 다운로드)
///
/// 청크를 도착 순서대로 해당 오프셋에 바로 씀
#[derive(Debug)]
pub struct SeekSink<W> {
    inner: W,
}

impl<W: Write + Seek> SeekSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> ChunkSink for SeekSink<W> {
    fn place(&mut self, _seq: SeqId, offset: u64, content: &[u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(content)?;
        Ok(())
    }
}

/// 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// 전체 길이 확정
    Metadata { expected_total: u64 },

    /// 새 청크 배치
    Chunk { seq: SeqId, len: usize },

    /// 이미 받은 청크
    Duplicate { seq: SeqId },

    /// 전송과 무관한 패킷
    Ignored,
}

/// 재조립기
///
/// 한 번의 전송(카탈로그 또는 파일 하나)에 대한 수신 상태
pub struct Reassembler<S> {
    sink: S,
    max_chunk: usize,

    /// METADATA 수신 전에는 None
    expected_total: Option<u64>,

    /// 지금까지 배치한 바이트
    received_total: u64,

    /// 이미 센 시퀀스 ID
    seen: HashSet<SeqId>,

    stats: TransferStats,
}

impl<S: ChunkSink> Reassembler<S> {
    pub fn new(sink: S, max_chunk: usize) -> Self {
        Self {
            sink,
            max_chunk,
            expected_total: None,
            received_total: 0,
            seen: HashSet::new(),
            stats: TransferStats::new(),
        }
    }

    /// 패킷 처리
    pub fn accept(&mut self, packet: &Packet) -> Result<Progress> {
        match packet {
            Packet::Metadata { total_len } => {
                let total = *total_len as u64;
                if self.expected_total.is_some_and(|prev| prev != total) {
                    debug!("METADATA 길이 변경: {:?} -> {}", self.expected_total, total);
                }
                self.expected_total = Some(total);
                Ok(Progress::Metadata {
                    expected_total: total,
                })
            }

            Packet::Data { seq, content } => {
                if *seq < 0 {
                    return Err(Error::MalformedPacket {
                        reason: "DATA 시퀀스 ID가 음수",
                    });
                }
                if content.len() > self.max_chunk {
                    return Err(Error::MalformedPacket {
                        reason: "DATA 청크가 최대 크기 초과",
                    });
                }

                if !self.seen.insert(*seq) {
                    self.stats.record_duplicate();
                    return Ok(Progress::Duplicate { seq: *seq });
                }

                self.sink
                    .place(*seq, chunk_offset(*seq, self.max_chunk), content)?;
                self.received_total += content.len() as u64;
                self.stats.record_chunk(content.len());

                Ok(Progress::Chunk {
                    seq: *seq,
                    len: content.len(),
                })
            }

            _ => Ok(Progress::Ignored),
        }
    }

    /// 완료 여부 (METADATA 수신 후 바이트 수 일치)
    pub fn is_complete(&self) -> bool {
        self.expected_total == Some(self.received_total)
    }

    pub fn has_metadata(&self) -> bool {
        self.expected_total.is_some()
    }

    pub fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    pub fn received_total(&self) -> u64 {
        self.received_total
    }

    /// 진행률 (0.0 ~ 1.0), 길이를 모르면 None
    pub fn progress(&self) -> Option<f64> {
        self.expected_total.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.received_total as f64 / total as f64
            }
        })
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
