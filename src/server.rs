//! 서버
//!
//! 소켓 하나로 모든 클라이언트를 처리함. 수신 루프는 디코딩과 세션
//! 전달만 하고, 실제 처리는 세션 태스크가 담당.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::link::bind_socket;
use crate::packet::Packet;
use crate::session::SessionRegistry;
use crate::{Config, Result};

/// 수신 버퍼 크기 (최대 UDP 데이터그램)
const RECV_BUFFER_LEN: usize = 65_535;

/// 파일 제공 서버
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: SessionRegistry,
    running: AtomicBool,
    shutdown: Notify,
}

impl Server {
    /// 설정 포트의 모든 인터페이스에 바인딩
    pub async fn bind(config: Config, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        Self::bind_addr(addr, config, catalog).await
    }

    /// 지정 주소에 바인딩
    pub async fn bind_addr(
        addr: SocketAddr,
        config: Config,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self> {
        let socket = Arc::new(bind_socket(addr, &config).await?);
        let registry = SessionRegistry::new(socket.clone(), config, catalog);

        Ok(Self {
            socket,
            registry,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// 수신 루프 실행. [`Server::stop`] 호출 시 반환
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Server listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        while self.running.load(Ordering::SeqCst) {
            let (len, addr) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // 상대 포트가 닫힌 경우 등 일시적 에러는 루프를 멈추지 않음
                        warn!("수신 실패: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.notified() => break,
            };

            match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => self.registry.dispatch(addr, packet),
                Err(e) => debug!("{}의 패킷 버림: {}", addr, e),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.registry.shutdown();
        info!("Server stopped");
        Ok(())
    }

    /// 수신 루프 정지 요청
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // 대기 중인 루프가 없으면 허가를 남겨 다음 대기에서 바로 깨어남
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
