//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 통계
///
/// 송신측은 큐잉/재전송/확인 수를, 수신측은 고유/중복 청크 수를 기록함
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 고유 페이로드 바이트
    pub total_bytes: u64,

    /// 고유 청크 수
    pub total_chunks: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 송신한 데이터그램 수 (재전송 포함)
    pub sent_packets: u64,

    /// 재전송 패스에서 다시 보낸 데이터그램 수
    pub retransmitted_packets: u64,

    /// 수신 확인된 항목 수
    pub acknowledged: u64,

    /// 송신 실패 수
    pub send_errors: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
            total_chunks: 0,
            duplicate_chunks: 0,
            sent_packets: 0,
            retransmitted_packets: 0,
            acknowledged: 0,
            send_errors: 0,
        }
    }

    /// 새 청크 기록
    pub fn record_chunk(&mut self, size: usize) {
        self.total_chunks += 1;
        self.total_bytes += size as u64;
    }

    /// 중복 청크 기록
    pub fn record_duplicate(&mut self) {
        self.duplicate_chunks += 1;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 중복 비율 (수신한 청크 중 중복의 비율)
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.total_chunks + self.duplicate_chunks;
        if total == 0 {
            return 0.0;
        }
        self.duplicate_chunks as f64 / total as f64
    }

    /// 데이터그램당 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.sent_packets == 0 {
            return 0.0;
        }
        self.retransmitted_packets as f64 / self.sent_packets as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Chunks: {} | Bytes: {} | Throughput: {:.2} MB/s | Duplicates: {:.1}% | Sent: {} (retransmit {:.1}%) | Acked: {}",
            self.elapsed().as_secs_f64(),
            self.total_chunks,
            self.total_bytes,
            self.throughput() / 1_000_000.0,
            self.duplicate_ratio() * 100.0,
            self.sent_packets,
            self.retransmit_ratio() * 100.0,
            self.acknowledged,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.duplicate_ratio(), 0.0);
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.record_chunk(503);
        stats.record_chunk(503);
        stats.record_chunk(194);
        stats.record_duplicate();

        assert_eq!(stats.total_bytes, 1200);
        assert_eq!(stats.duplicate_ratio(), 0.25);

        stats.sent_packets = 10;
        stats.retransmitted_packets = 6;
        assert!((stats.retransmit_ratio() - 0.6).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Chunks: 3"));
    }
}
