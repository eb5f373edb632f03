//! 프로토콜 설정

use std::time::Duration;

use crate::{DEFAULT_PORT, DEFAULT_READ_WINDOW_CHUNKS, MAX_PACKET_SIZE, PACKET_OVERHEAD};

/// CTP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 서버 포트
    pub port: u16,

    /// 데이터그램 최대 크기 (바이트, 태그 포함)
    pub max_packet_size: usize,

    /// 핸드쉐이크 전체 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 핸드쉐이크 재전송 간격 겸 응답 대기 시간 (밀리초)
    pub handshake_retry_ms: u64,

    /// 세션 처리 루프 유휴 대기 (밀리초)
    /// 타임아웃 자체로는 아무 동작도 하지 않음
    pub idle_wait_ms: u64,

    /// 클라이언트 전송 완료 폴링 간격 (밀리초)
    pub poll_interval_ms: u64,

    /// 재전송 루프 주기 (밀리초)
    /// 매 주기마다 미확인 항목 전체를 재전송
    pub retransmit_interval_ms: u64,

    /// 파일 읽기 윈도우 (청크 수)
    pub read_window_chunks: usize,

    /// 소켓 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 소켓 송신 버퍼 크기
    pub send_buffer_size: usize,

    /// 세션별 수신 큐 길이
    /// 가득 차면 패킷을 버림 (상대가 재전송)
    pub session_queue_len: usize,

    /// 진행 없는 전송을 포기하는 시간 (밀리초)
    /// None이면 확인될 때까지 무한 재전송
    pub stall_timeout_ms: Option<u64>,

    /// METADATA 확인 후에 데이터 청크 전송 시작
    pub await_metadata_ack: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_packet_size: MAX_PACKET_SIZE,
            handshake_timeout_ms: 10_000,     // 10초
            handshake_retry_ms: 10,           // 10ms
            idle_wait_ms: 5_000,              // 5초
            poll_interval_ms: 100,            // 100ms
            retransmit_interval_ms: 5,        // 5ms
            read_window_chunks: DEFAULT_READ_WINDOW_CHUNKS,
            recv_buffer_size: 32_784,
            send_buffer_size: 32_784,
            session_queue_len: 4096,
            stall_timeout_ms: None,           // 무한 재전송
            await_metadata_ack: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// DATA 패킷 하나에 담을 수 있는 최대 바이트
    pub fn max_chunk_size(&self) -> usize {
        self.max_packet_size.saturating_sub(PACKET_OVERHEAD).max(1)
    }

    /// 파일 읽기 윈도우 크기 (바이트)
    pub fn read_window_bytes(&self) -> usize {
        self.max_chunk_size() * self.read_window_chunks.max(1)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// 같은 LAN 내 전송용 설정
    pub fn lan() -> Self {
        Self {
            retransmit_interval_ms: 2,
            read_window_chunks: 400,
            recv_buffer_size: 2 * 1024 * 1024, // 2MB
            send_buffer_size: 2 * 1024 * 1024,
            session_queue_len: 16_384,
            stall_timeout_ms: Some(30_000),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unreliable_network() -> Self {
        Self {
            handshake_timeout_ms: 20_000,
            retransmit_interval_ms: 20,
            read_window_chunks: 50,
            stall_timeout_ms: Some(120_000),
            await_metadata_ack: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunk_size() {
        let config = Config::default();
        assert_eq!(config.max_chunk_size(), 503);
        assert_eq!(config.read_window_bytes(), 50_300);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.handshake_retry(), Duration::from_millis(10));
        assert!(config.stall_timeout().is_none());
    }

    #[test]
    fn test_presets_keep_wire_limits() {
        for config in [Config::lan(), Config::unreliable_network()] {
            assert_eq!(config.max_packet_size, MAX_PACKET_SIZE);
            assert_eq!(config.port, DEFAULT_PORT);
            assert!(config.stall_timeout().is_some());
        }
    }
}
