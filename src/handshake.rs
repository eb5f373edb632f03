//! 연결 핸드쉐이크
//!
//! ```text
//! Disconnected ──시작──▶ Connecting ──응답 수신──▶ Connected
//!      ▲                     │                        │
//!      └────── 타임아웃 ─────┘        DISCONNECT ─────┘
//! ```
//!
//! 클라이언트는 CONNECT를 보내고 ACK를 기다리며, 서버는 ACK를 보내고
//! REQUEST_INFO(클라이언트가 ACK를 받고 다음 단계로 넘어갔다는 증거)를 기다림.
//! 양쪽 모두 재전송 간격마다 다시 보내는 단순 폴링 루프이며 백오프는 없음.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::packet::{Packet, PacketType};
use crate::{Config, Error, Result};

/// 핸드쉐이크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 핸드쉐이크 상태 머신
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    timeout: Duration,
    retry: Duration,
}

impl Handshake {
    pub fn new(config: &Config) -> Self {
        Self {
            state: HandshakeState::Disconnected,
            timeout: config.handshake_timeout(),
            retry: config.handshake_retry(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == HandshakeState::Connected
    }

    /// 클라이언트측: CONNECT 반복 전송, ACK 수신 시 연결
    pub async fn connect(
        &mut self,
        link: &Link,
        inbox: &mut mpsc::Receiver<Packet>,
    ) -> Result<()> {
        self.exchange(link, inbox, Packet::Connect, PacketType::Ack)
            .await?;
        info!("Connected to server {}", link.peer());
        Ok(())
    }

    /// 서버측: ACK 반복 전송, REQUEST_INFO 수신 시 연결
    ///
    /// 증거로 받은 REQUEST_INFO를 반환하므로 호출자가 이어서 처리할 수 있음
    pub async fn accept(
        &mut self,
        link: &Link,
        inbox: &mut mpsc::Receiver<Packet>,
    ) -> Result<Packet> {
        let proof = self
            .exchange(link, inbox, Packet::Ack, PacketType::RequestInfo)
            .await?;
        info!("Client connected: {}", link.peer());
        Ok(proof)
    }

    /// 연결 종료
    pub fn disconnect(&mut self) {
        self.state = HandshakeState::Disconnected;
    }

    async fn exchange(
        &mut self,
        link: &Link,
        inbox: &mut mpsc::Receiver<Packet>,
        outgoing: Packet,
        expected: PacketType,
    ) -> Result<Packet> {
        self.state = HandshakeState::Connecting;
        let datagram = outgoing.to_bytes();
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            if let Err(e) = link.send_raw(&datagram).await {
                self.state = HandshakeState::Disconnected;
                return Err(e);
            }
            attempts += 1;

            match tokio::time::timeout(self.retry, inbox.recv()).await {
                Ok(Some(packet)) if packet.packet_type() == expected => {
                    self.state = HandshakeState::Connected;
                    debug!(
                        "핸드쉐이크 완료: {} ({}회 시도, {:?})",
                        link.peer(),
                        attempts,
                        start.elapsed()
                    );
                    return Ok(packet);
                }
                Ok(Some(Packet::Disconnect)) => {
                    self.state = HandshakeState::Disconnected;
                    return Err(Error::ConnectionClosed);
                }
                Ok(Some(other)) => {
                    debug!("핸드쉐이크 중 무시: {}", other.packet_type());
                }
                Ok(None) => {
                    self.state = HandshakeState::Disconnected;
                    return Err(Error::ChannelError);
                }
                Err(_) => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                self.state = HandshakeState::Disconnected;
                warn!("Connection timed out: {} ({}회 시도)", link.peer(), attempts);
                return Err(Error::HandshakeTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
    }
}
