//! # CTP (Catalog Transfer Protocol)
//!
//! UDP 기반 확인 응답형 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **청크 단위 확인**: 모든 DATA/METADATA 청크에 RECEIVED 응답
//! - **일괄 재전송**: 확인되지 않은 청크 전체를 짧은 주기로 다시 보냄
//! - **순서 무관 조립**: 시퀀스 ID로 위치를 계산해 도착 순서와 무관하게 조립
//! - **세션 격리**: 원격 엔드포인트마다 독립된 상태와 태스크
//! - **스트리밍 읽기**: 파일을 윈도우 단위로 읽어 전체를 메모리에 올리지 않음
//!
//! ## 패킷 형식
//! ```text
//! +------+----------------------+
//! | 타입 | 페이로드 (빅엔디언)  |
//! | 1B   | 가변                 |
//! +------+----------------------+
//! ```

pub mod catalog;
pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod link;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod stats;

pub use catalog::{Catalog, CatalogEntry, DirectoryCatalog, MemoryCatalog};
pub use chunk::{ChunkBuilder, SeqId, METADATA_SEQ};
pub use client::{Client, TransferReport};
pub use config::Config;
pub use error::{Error, Result};
pub use handshake::{Handshake, HandshakeState};
pub use packet::{Packet, PacketType};
pub use receiver::Reassembler;
pub use sender::{PendingTable, ReliableSender, Retransmitter};
pub use server::Server;
pub use session::SessionRegistry;
pub use stats::TransferStats;

/// 기본 서버 포트
pub const DEFAULT_PORT: u16 = 9091;

/// 최대 데이터그램 크기 (바이트)
///
/// 단편화 없이 전달이 보장되는 최소 IPv4 재조립 크기 기준
pub const MAX_PACKET_SIZE: usize = 508;

/// DATA 패킷 헤더 크기 (타입 1B + 시퀀스 ID 4B)
pub const PACKET_OVERHEAD: usize = 5;

/// 파일 읽기 윈도우 (청크 수)
pub const DEFAULT_READ_WINDOW_CHUNKS: usize = 100;
