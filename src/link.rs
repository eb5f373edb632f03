//! UDP 소켓 및 송신 경로

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::warn;

use crate::packet::Packet;
use crate::{Config, Result};

/// 소켓 바인딩 후 커널 버퍼 크기 설정
///
/// 버퍼 크기 설정 실패는 치명적이지 않으므로 경고만 남김
pub async fn bind_socket(addr: SocketAddr, config: &Config) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;

    let sock_ref = socket2::SockRef::from(&socket);
    if let Err(e) = sock_ref.set_recv_buffer_size(config.recv_buffer_size) {
        warn!("수신 버퍼 설정 실패: {}", e);
    }
    if let Err(e) = sock_ref.set_send_buffer_size(config.send_buffer_size) {
        warn!("송신 버퍼 설정 실패: {}", e);
    }

    Ok(socket)
}

/// 한 상대 엔드포인트로 향하는 송신 경로 (공유 소켓 + 상대 주소)
#[derive(Debug, Clone)]
pub struct Link {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Link {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// 상대 주소
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// 패킷 전송
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.send_raw(&packet.to_bytes()).await
    }

    /// 이미 인코딩된 데이터그램 전송
    pub async fn send_raw(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }
}
