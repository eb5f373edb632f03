//! 에러 타입 정의

use thiserror::Error;

/// CTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 패킷: {reason}")]
    MalformedPacket { reason: &'static str },

    #[error("알 수 없는 패킷 타입: {tag}")]
    UnknownPacketType { tag: u8 },

    #[error("핸드쉐이크 타임아웃: {elapsed_ms}ms 동안 응답 없음")]
    HandshakeTimeout { elapsed_ms: u64 },

    #[error("존재하지 않는 파일: {name}")]
    UnknownArtifact { name: String },

    #[error("전송 정지: {idle_ms}ms 동안 진행 없음 (대기 중 {pending}개)")]
    TransferStall { idle_ms: u64, pending: usize },

    #[error("페이로드가 너무 큼: {len} bytes (최대 {max})")]
    PayloadTooLarge { len: u64, max: u64 },

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
