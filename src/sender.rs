//! 송신자 (서버측)
//!
//! - 페이로드를 청크로 분할해 미확인 테이블에 등록
//! - 테이블에 남은 항목 전체를 주기적으로 재전송
//! - RECEIVED 수신 시 항목 제거 (항목이 빠지는 유일한 경로)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::chunk::{ChunkBuilder, SeqId, METADATA_SEQ};
use crate::link::Link;
use crate::packet::Packet;
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 미확인 항목
#[derive(Debug)]
struct PendingEntry {
    /// 인코딩된 데이터그램
    datagram: Bytes,

    /// 전송 시도 횟수
    attempts: u32,
}

/// 미확인 송신 테이블
///
/// 처리 루프(삽입), 수신 루프(확인 제거), 재전송 루프(순회)가
/// 동시에 접근함. 샤드 락 외의 전역 락은 없음.
pub struct PendingTable {
    entries: DashMap<SeqId, PendingEntry>,

    /// 삽입/제거 알림
    changed: Notify,

    /// 마지막 진행 시각 (삽입 또는 확인)
    last_progress: Mutex<Instant>,

    /// 송신 통계
    stats: RwLock<TransferStats>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            changed: Notify::new(),
            last_progress: Mutex::new(Instant::now()),
            stats: RwLock::new(TransferStats::new()),
        }
    }

    /// DATA 또는 METADATA 패킷 등록
    ///
    /// 다른 타입은 확인 대상이 아니므로 무시함
    pub fn insert(&self, packet: &Packet) {
        let seq = match packet {
            Packet::Data { seq, content } => {
                self.stats.write().record_chunk(content.len());
                *seq
            }
            Packet::Metadata { .. } => METADATA_SEQ,
            other => {
                debug!("확인 대상이 아닌 패킷: {}", other.packet_type());
                return;
            }
        };

        self.entries.insert(
            seq,
            PendingEntry {
                datagram: packet.to_bytes(),
                attempts: 0,
            },
        );
        self.touch();
        self.changed.notify_waiters();
    }

    /// 수신 확인 처리. 제거된 항목이 있으면 true
    ///
    /// 같은 ID를 여러 번 확인해도 결과는 한 번과 같음
    pub fn acknowledge(&self, seq: SeqId) -> bool {
        let removed = self.entries.remove(&seq).is_some();
        if removed {
            self.stats.write().acknowledged += 1;
            self.touch();
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn contains(&self, seq: SeqId) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 미확인 항목 전체 폐기. 폐기된 개수 반환
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.touch();
        self.changed.notify_waiters();
        count
    }

    /// 현재 미확인 ID 목록 (정렬됨)
    pub fn pending_ids(&self) -> Vec<SeqId> {
        let mut ids: Vec<SeqId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// 마지막 진행 이후 경과 시간
    pub fn idle_for(&self) -> Duration {
        self.last_progress.lock().elapsed()
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 해당 ID가 확인(또는 폐기)될 때까지 대기
    pub async fn wait_acknowledged(&self, seq: SeqId) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.contains(seq) {
                return;
            }
            notified.await;
        }
    }

    /// 테이블에 항목이 생길 때까지 대기
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// 재전송용 스냅샷
    ///
    /// 전송 중 샤드 락을 잡지 않도록 복사해서 반환 (Bytes 복사는 참조 카운트 증가뿐).
    /// ID 순 정렬이므로 METADATA가 항상 먼저 나감
    fn snapshot(&self) -> Vec<(SeqId, Bytes, u32)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().datagram.clone(), e.value().attempts))
            .collect();
        entries.sort_unstable_by_key(|(seq, _, _)| *seq);
        entries
    }

    fn record_sent(&self, seq: SeqId, retransmit: bool) {
        if let Some(mut entry) = self.entries.get_mut(&seq) {
            entry.attempts = entry.attempts.saturating_add(1);
        }
        let mut stats = self.stats.write();
        stats.sent_packets += 1;
        if retransmit {
            stats.retransmitted_packets += 1;
        }
    }

    fn record_send_error(&self) {
        self.stats.write().send_errors += 1;
    }

    fn touch(&self) {
        *self.last_progress.lock() = Instant::now();
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 신뢰 전송기
///
/// 요청 하나당 하나씩 생성되어 세션의 미확인 테이블에 청크를 등록함.
/// 실제 전송은 [`Retransmitter`]가 담당.
pub struct ReliableSender {
    table: Arc<PendingTable>,
    builder: ChunkBuilder,

    /// 파일 읽기 윈도우 (바이트, 청크 크기의 배수)
    window_bytes: usize,

    await_metadata_ack: bool,
}

impl ReliableSender {
    pub fn new(table: Arc<PendingTable>, config: &Config) -> Self {
        Self {
            table,
            builder: ChunkBuilder::new(config.max_chunk_size()),
            window_bytes: config.read_window_bytes(),
            await_metadata_ack: config.await_metadata_ack,
        }
    }

    /// 메모리 페이로드 전송 등록. 등록된 DATA 청크 수 반환
    pub async fn send_whole(&self, payload: &[u8]) -> Result<usize> {
        self.queue_metadata(payload.len() as u64).await?;

        let chunks = self.builder.split(0, payload);
        for chunk in &chunks {
            self.table.insert(chunk);
        }

        debug!("페이로드 등록: {} bytes, {} 청크", payload.len(), chunks.len());
        Ok(chunks.len())
    }

    /// 스트림 페이로드 전송 등록. 등록된 DATA 청크 수 반환
    ///
    /// 윈도우 단위로 읽어 등록하므로 전체를 메모리에 올리지 않음.
    /// 소스가 `len`보다 짧으면 `UnexpectedEof` IO 에러.
    pub async fn send_stream<R>(&self, mut reader: R, len: u64) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.queue_metadata(len).await?;

        let mut buf = vec![0u8; (self.window_bytes as u64).min(len) as usize];
        let mut remaining = len;
        let mut next_seq: SeqId = 0;

        while remaining > 0 {
            let want = (self.window_bytes as u64).min(remaining) as usize;
            reader.read_exact(&mut buf[..want]).await?;

            let chunks = self.builder.split(next_seq, &buf[..want]);
            for chunk in &chunks {
                self.table.insert(chunk);
            }

            next_seq += chunks.len() as SeqId;
            remaining -= want as u64;
        }

        debug!("스트림 등록: {} bytes, {} 청크", len, next_seq);
        Ok(next_seq as usize)
    }

    async fn queue_metadata(&self, len: u64) -> Result<()> {
        let metadata = self.builder.metadata(len)?;
        self.table.insert(&metadata);

        if self.await_metadata_ack {
            self.table.wait_acknowledged(METADATA_SEQ).await;
        }
        Ok(())
    }
}

/// 재전송 루프
///
/// 세션 수명 동안 실행되며 매 주기마다 테이블의 모든 항목을 다시 보냄.
/// 테이블이 비어 있으면 삽입 알림까지 대기.
pub struct Retransmitter {
    link: Link,
    table: Arc<PendingTable>,
    interval: Duration,
    idle_wait: Duration,
    stall_timeout: Option<Duration>,
    running: Arc<AtomicBool>,
}

impl Retransmitter {
    pub fn new(
        link: Link,
        table: Arc<PendingTable>,
        config: &Config,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            link,
            table,
            interval: config.retransmit_interval(),
            idle_wait: config.idle_wait(),
            stall_timeout: config.stall_timeout(),
            running,
        }
    }

    /// 실행. 정지 타임아웃이 설정된 경우 진행이 없으면 테이블을 비우고
    /// `TransferStall`로 종료. 전송 실패 시 IO 에러로 종료
    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            if self.table.is_empty() {
                let _ = tokio::time::timeout(self.idle_wait, self.table.wait_non_empty()).await;
                continue;
            }

            ticker.tick().await;
            self.resend_all().await?;

            if let Some(limit) = self.stall_timeout {
                let idle = self.table.idle_for();
                if !self.table.is_empty() && idle >= limit {
                    let pending = self.table.clear();
                    warn!(
                        "{} 전송 정지: {:.1}s 동안 확인 없음, {}개 항목 폐기",
                        self.link.peer(),
                        idle.as_secs_f64(),
                        pending
                    );
                    return Err(Error::TransferStall {
                        idle_ms: idle.as_millis() as u64,
                        pending,
                    });
                }
            }
        }

        Ok(())
    }

    async fn resend_all(&self) -> Result<()> {
        for (seq, datagram, attempts) in self.table.snapshot() {
            // 스냅샷 이후 확인된 항목은 건너뜀
            if !self.table.contains(seq) {
                continue;
            }

            if let Err(e) = self.link.send_raw(&datagram).await {
                warn!("재전송 실패: {} seq={}: {}", self.link.peer(), seq, e);
                self.table.record_send_error();
                return Err(e);
            }
            self.table.record_sent(seq, attempts > 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::UdpSocket;

    fn small_config(max_chunk: usize, window_chunks: usize) -> Config {
        Config {
            max_packet_size: max_chunk + crate::PACKET_OVERHEAD,
            read_window_chunks: window_chunks,
            retransmit_interval_ms: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_chunking_scenario_1200_bytes() {
        let table = Arc::new(PendingTable::new());
        let sender = ReliableSender::new(table.clone(), &Config::default());

        let chunks = sender.send_whole(&[0xAB; 1200]).await.unwrap();

        assert_eq!(chunks, 3);
        assert_eq!(table.pending_ids(), vec![-1, 0, 1, 2]);

        for seq in [-1, 0, 1, 2] {
            assert!(table.acknowledge(seq));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_acknowledge_idempotent() {
        let table = PendingTable::new();
        for seq in 0..4 {
            table.insert(&Packet::Data {
                seq,
                content: Bytes::from_static(b"data"),
            });
        }

        assert!(table.acknowledge(2));
        let once = table.pending_ids();
        assert!(!table.acknowledge(2));
        assert_eq!(table.pending_ids(), once);
        assert_eq!(once, vec![0, 1, 3]);
        assert_eq!(table.stats().acknowledged, 1);
    }

    #[test]
    fn test_non_data_packets_ignored() {
        let table = PendingTable::new();
        table.insert(&Packet::Ack);
        table.insert(&Packet::Received { seq: 3 });
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_send_stream_spans_windows() {
        let table = Arc::new(PendingTable::new());
        let sender = ReliableSender::new(table.clone(), &small_config(10, 3));
        let data: Vec<u8> = (0..95u8).collect();

        let chunks = sender.send_stream(&data[..], data.len() as u64).await.unwrap();

        assert_eq!(chunks, 10);
        assert_eq!(table.pending_ids(), (-1..10).collect::<Vec<_>>());

        // 윈도우 경계를 넘어도 청크 내용이 오프셋과 일치해야 함
        let snapshot: HashMap<SeqId, Bytes> = table
            .snapshot()
            .into_iter()
            .map(|(seq, datagram, _)| (seq, datagram))
            .collect();
        for seq in 0..10 {
            match Packet::from_bytes(&snapshot[&seq]).unwrap() {
                Packet::Data { content, .. } => {
                    let start = seq as usize * 10;
                    let end = (start + 10).min(data.len());
                    assert_eq!(content.as_ref(), &data[start..end]);
                }
                other => panic!("DATA 아님: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_stream_short_source() {
        let table = Arc::new(PendingTable::new());
        let sender = ReliableSender::new(table, &small_config(10, 3));

        let result = sender.send_stream(&[1u8, 2, 3][..], 50).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let table = Arc::new(PendingTable::new());
        let sender = ReliableSender::new(table.clone(), &Config::default());

        let result = sender
            .send_stream(&[][..], crate::chunk::MAX_PAYLOAD_LEN + 1)
            .await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_await_metadata_ack() {
        let table = Arc::new(PendingTable::new());
        let config = Config {
            await_metadata_ack: true,
            ..Config::default()
        };
        let sender = ReliableSender::new(table.clone(), &config);

        let task = tokio::spawn(async move { sender.send_whole(&[1u8; 1200]).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.pending_ids(), vec![-1]);

        table.acknowledge(METADATA_SEQ);
        let chunks = task.await.unwrap().unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(table.pending_ids(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_retransmits_until_acknowledged() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Link::new(local, peer.local_addr().unwrap());

        let table = Arc::new(PendingTable::new());
        let running = Arc::new(AtomicBool::new(true));
        let config = small_config(503, 100);
        let task = tokio::spawn(
            Retransmitter::new(link, table.clone(), &config, running.clone()).run(),
        );

        ReliableSender::new(table.clone(), &config)
            .send_whole(b"hello")
            .await
            .unwrap();

        // 확인 전에는 두 항목 모두 반복 전송되어야 함
        let mut seen: HashMap<SeqId, usize> = HashMap::new();
        let mut buf = [0u8; 1024];
        while seen.values().filter(|&&n| n >= 2).count() < 2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .expect("재전송 없음")
                .unwrap();
            let seq = match Packet::from_bytes(&buf[..len]).unwrap() {
                Packet::Data { seq, .. } => seq,
                Packet::Metadata { total_len } => {
                    assert_eq!(total_len, 5);
                    METADATA_SEQ
                }
                other => panic!("예상치 못한 패킷: {:?}", other),
            };
            *seen.entry(seq).or_default() += 1;
        }

        table.acknowledge(METADATA_SEQ);
        table.acknowledge(0);
        assert!(table.is_empty());
        assert!(table.stats().retransmitted_packets > 0);

        running.store(false, Ordering::SeqCst);
        table.clear();
        task.abort();
    }

    #[tokio::test]
    async fn test_stall_timeout_abandons_transfer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Link::new(local, peer.local_addr().unwrap());

        let table = Arc::new(PendingTable::new());
        let config = Config {
            stall_timeout_ms: Some(50),
            ..small_config(503, 100)
        };
        let running = Arc::new(AtomicBool::new(true));

        ReliableSender::new(table.clone(), &config)
            .send_whole(&[9u8; 2000])
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            Retransmitter::new(link, table.clone(), &config, running).run(),
        )
        .await
        .expect("정지 타임아웃이 동작하지 않음");

        assert!(matches!(
            result,
            Err(Error::TransferStall { pending: 5, .. })
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_ends_retransmitter() {
        // IPv4 소켓에서 IPv6 주소로는 보낼 수 없음
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let link = Link::new(local, "[::1]:9".parse().unwrap());

        let table = Arc::new(PendingTable::new());
        let config = small_config(503, 100);
        let running = Arc::new(AtomicBool::new(true));

        ReliableSender::new(table.clone(), &config)
            .send_whole(b"hello")
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            Retransmitter::new(link, table.clone(), &config, running).run(),
        )
        .await
        .expect("전송 실패 후에도 재전송 루프가 계속됨");

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(table.stats().send_errors, 1);
    }
}
