//! 청크 분할
//!
//! - 페이로드: 전송 단위가 되는 논리 바이트열 (카탈로그 목록 또는 파일)
//! - Chunk: DATA 패킷 하나에 담기는 조각 (최대 `max_packet_size - 5` bytes)

use bytes::Bytes;

use crate::packet::Packet;
use crate::{Error, Result};

/// 시퀀스 ID (32비트, 전송 내 청크 인덱스)
pub type SeqId = i32;

/// METADATA 의사 항목의 시퀀스 ID
pub const METADATA_SEQ: SeqId = -1;

/// METADATA 길이 필드(부호 있는 32비트)로 표현 가능한 최대 페이로드
pub const MAX_PAYLOAD_LEN: u64 = i32::MAX as u64;

/// 페이로드를 나눈 청크 수
pub fn chunk_count(len: u64, max_chunk: usize) -> u64 {
    len.div_ceil(max_chunk as u64)
}

/// 청크의 페이로드 내 바이트 오프셋
pub fn chunk_offset(seq: SeqId, max_chunk: usize) -> u64 {
    seq as u64 * max_chunk as u64
}

/// 청크 생성기 (송신측)
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    max_chunk: usize,
}

impl ChunkBuilder {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            max_chunk: max_chunk.max(1),
        }
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// 전체 길이를 담은 METADATA 패킷
    pub fn metadata(&self, total_len: u64) -> Result<Packet> {
        let total_len = u32::try_from(total_len)
            .ok()
            .filter(|len| *len as u64 <= MAX_PAYLOAD_LEN)
            .ok_or(Error::PayloadTooLarge {
                len: total_len,
                max: MAX_PAYLOAD_LEN,
            })?;

        Ok(Packet::Metadata { total_len })
    }

    /// 데이터를 DATA 패킷들로 분할
    ///
    /// `first_seq`부터 1씩 증가하는 ID를 부여하므로 윈도우 단위로
    /// 나눠 호출해도 ID가 전역적으로 이어짐.
    pub fn split(&self, first_seq: SeqId, data: &[u8]) -> Vec<Packet> {
        data.chunks(self.max_chunk)
            .enumerate()
            .map(|(idx, content)| Packet::Data {
                seq: first_seq + idx as SeqId,
                content: Bytes::copy_from_slice(content),
            })
            .collect()
    }
}
