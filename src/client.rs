//! 클라이언트
//!
//! - 연결 핸드쉐이크 후 카탈로그 목록 또는 파일 하나씩 요청
//! - 수신 태스크는 서버 주소의 패킷만 디코딩해 큐에 넣음
//! - 수신 확인(RECEIVED)은 수신 태스크가 큐에 넣은 즉시 보냄. 전송 사이나
//!   METADATA 전에 도착한 청크도 확인됨 (큐가 가득 차 버려진 패킷은 확인하지
//!   않으므로 서버가 다시 보냄)

use std::ffi::OsStr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::{parse_listing, CatalogEntry};
use crate::chunk::chunk_count;
use crate::handshake::{Handshake, HandshakeState};
use crate::link::{bind_socket, Link};
use crate::packet::Packet;
use crate::receiver::{acknowledgment, ChunkSink, MemorySink, Progress, Reassembler, SeekSink};
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 기본 다운로드 디렉터리
pub const DEFAULT_DOWNLOAD_DIR: &str = "Downloaded Files";

/// 연결 종료 시 DISCONNECT 전송 횟수 (확인 응답이 없으므로 여러 번 보냄)
const DISCONNECT_REPEAT: usize = 3;

/// 다운로드 결과
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
    pub stats: TransferStats,
}

/// 파일 수신 클라이언트
pub struct Client {
    link: Link,
    inbox: mpsc::Receiver<Packet>,
    handshake: Handshake,
    config: Config,
    recv_task: JoinHandle<()>,

    /// 마지막으로 받은 카탈로그
    listing: Option<Vec<CatalogEntry>>,
}

impl Client {
    /// 소켓 바인딩 후 핸드쉐이크까지 수행
    pub async fn connect(config: Config, server: SocketAddr) -> Result<Self> {
        let mut client = Self::bind(config, server).await?;
        client.handshake().await?;
        Ok(client)
    }

    /// 소켓만 바인딩 (핸드쉐이크 전)
    pub async fn bind(config: Config, server: SocketAddr) -> Result<Self> {
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = Arc::new(bind_socket(local, &config).await?);

        let (inbox_tx, inbox) = mpsc::channel(config.session_queue_len.max(1));
        let recv_task = tokio::spawn(receive_loop(socket.clone(), server, inbox_tx));

        debug!("클라이언트 소켓: {}", socket.local_addr()?);

        Ok(Self {
            link: Link::new(socket, server),
            inbox,
            handshake: Handshake::new(&config),
            config,
            recv_task,
            listing: None,
        })
    }

    /// 연결 핸드쉐이크
    pub async fn handshake(&mut self) -> Result<()> {
        self.handshake.connect(&self.link, &mut self.inbox).await
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handshake.is_connected()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.link.peer()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.link.socket().local_addr()?)
    }

    /// 마지막으로 받은 카탈로그
    pub fn catalog(&self) -> Option<&[CatalogEntry]> {
        self.listing.as_deref()
    }

    /// 카탈로그 목록 요청. 목록 텍스트를 반환하고 파싱 결과는 보관
    pub async fn request_info(&mut self) -> Result<String> {
        let mut reassembler = Reassembler::new(MemorySink::new(), self.config.max_chunk_size());
        self.transfer(&Packet::RequestInfo, &mut reassembler).await?;

        let bytes = reassembler.into_sink().into_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.listing = Some(parse_listing(&text));

        Ok(text)
    }

    /// 파일 하나를 `dest_dir/name`으로 다운로드
    ///
    /// 카탈로그에 없는 이름은 서버에 요청하지 않고 `UnknownArtifact`로 실패.
    /// 카탈로그를 아직 받지 않았다면 먼저 요청함.
    pub async fn request_file(
        &mut self,
        name: &str,
        dest_dir: impl AsRef<Path>,
    ) -> Result<TransferReport> {
        if self.listing.is_none() {
            self.request_info().await?;
        }

        let listed = self
            .listing
            .iter()
            .flatten()
            .any(|entry| entry.name == name);
        // 서버가 준 이름이라도 경로 탈출은 허용하지 않음
        let plain = Path::new(name).file_name() == Some(OsStr::new(name));
        if !listed || !plain {
            return Err(Error::UnknownArtifact {
                name: name.to_owned(),
            });
        }

        let dest_dir = dest_dir.as_ref();
        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(name);
        let file = std::fs::File::create(&path)?;

        let start = Instant::now();
        let mut reassembler = Reassembler::new(SeekSink::new(file), self.config.max_chunk_size());
        let request = Packet::RequestFile {
            name: name.to_owned(),
        };

        if let Err(e) = self.transfer(&request, &mut reassembler).await {
            drop(reassembler);
            // 불완전한 파일은 남기지 않음
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        reassembler.sink_mut().flush()?;
        let elapsed = start.elapsed();
        let stats = reassembler.stats().clone();
        let bytes = reassembler.received_total();

        info!(
            "Downloaded {} ({} bytes) in {:.3}s",
            name,
            bytes,
            elapsed.as_secs_f64()
        );

        Ok(TransferReport {
            name: name.to_owned(),
            path,
            bytes,
            elapsed,
            stats,
        })
    }

    /// 연결 종료 통지 후 소켓 정리
    pub async fn disconnect(mut self) -> Result<()> {
        for _ in 0..DISCONNECT_REPEAT {
            self.link.send(&Packet::Disconnect).await?;
        }
        self.handshake.disconnect();
        info!("Disconnected from {}", self.link.peer());
        Ok(())
    }

    /// 요청 하나에 대한 수신 루프
    async fn transfer<S: ChunkSink>(
        &mut self,
        request: &Packet,
        reassembler: &mut Reassembler<S>,
    ) -> Result<()> {
        self.drain_stale().await;

        let poll = self.config.poll_interval();
        let stall_timeout = self.config.stall_timeout();

        self.link.send(request).await?;
        let mut last_request = Instant::now();
        let mut last_progress = Instant::now();

        while !reassembler.is_complete() {
            match tokio::time::timeout(poll, self.inbox.recv()).await {
                Ok(Some(packet)) => {
                    if Self::absorb(&packet, reassembler)? {
                        last_progress = Instant::now();
                    }
                }
                Ok(None) => return Err(Error::ChannelError),
                Err(_) => {}
            }

            // 요청 유실 대비: 진행이 없으면 요청 재전송. 서버는 미확인 항목이
            // 남아 있는 동안 같은 요청을 무시하므로 진행 중인 전송은 유지됨
            if last_progress.elapsed() >= poll && last_request.elapsed() >= poll {
                self.link.send(request).await?;
                last_request = Instant::now();
            }

            if let Some(limit) = stall_timeout {
                let idle = last_progress.elapsed();
                if idle >= limit {
                    let remaining = reassembler
                        .expected_total()
                        .map(|total| total.saturating_sub(reassembler.received_total()))
                        .unwrap_or(0);
                    return Err(Error::TransferStall {
                        idle_ms: idle.as_millis() as u64,
                        pending: chunk_count(remaining, self.config.max_chunk_size()) as usize,
                    });
                }
            }
        }

        Ok(())
    }

    /// 수신 패킷 하나 처리. 전송이 진행되었으면 true
    ///
    /// 확인 응답은 수신 태스크가 이미 보냄
    fn absorb<S: ChunkSink>(
        packet: &Packet,
        reassembler: &mut Reassembler<S>,
    ) -> Result<bool> {
        let progress = match reassembler.accept(packet) {
            Ok(progress) => progress,
            Err(Error::MalformedPacket { reason }) => {
                debug!("청크 버림: {}", reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        Ok(matches!(
            progress,
            Progress::Metadata { .. } | Progress::Chunk { .. }
        ))
    }

    /// 이전 전송의 잔여 패킷 제거
    ///
    /// 서버는 확인을 처리하기 전까지 재전송하므로 큐가 잠시 조용해질
    /// 때까지 비움 (최대 폴링 간격만큼)
    async fn drain_stale(&mut self) {
        let quiet = self.config.handshake_retry();
        let deadline = Instant::now() + self.config.poll_interval();
        let mut stale = 0usize;

        while Instant::now() < deadline {
            match tokio::time::timeout(quiet, self.inbox.recv()).await {
                Ok(Some(_)) => stale += 1,
                _ => break,
            }
        }

        if stale > 0 {
            debug!("잔여 패킷 {}개 버림", stale);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// 수신 태스크: 서버 주소의 패킷만 디코딩해 큐에 넣음
///
/// DATA/METADATA는 큐에 들어간 경우에만 중복 여부와 무관하게 바로 확인.
/// 큐가 가득 차면 확인 없이 버림
async fn receive_loop(socket: Arc<UdpSocket>, server: SocketAddr, inbox: mpsc::Sender<Packet>) {
    let mut buf = vec![0u8; 65_535];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("수신 실패: {}", e);
                continue;
            }
        };

        if from != server {
            debug!("서버가 아닌 {}의 패킷 무시", from);
            continue;
        }

        let packet = match Packet::from_bytes(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("패킷 버림: {}", e);
                continue;
            }
        };

        let ack = acknowledgment(&packet);
        match inbox.try_send(packet) {
            Ok(()) => {
                if let Some(ack) = ack {
                    if let Err(e) = socket.send_to(&ack.to_bytes(), server).await {
                        debug!("RECEIVED 전송 실패: {}", e);
                    }
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => debug!("클라이언트 큐 가득 참, 패킷 버림"),
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::server::Server;

    async fn spawn_server(catalog: MemoryCatalog) -> (Arc<Server>, SocketAddr) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Arc::new(
            Server::bind_addr(addr, Config::default(), Arc::new(catalog))
                .await
                .unwrap(),
        );
        let server_addr = server.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        (server, server_addr)
    }

    #[tokio::test]
    async fn test_request_info_caches_catalog() {
        let catalog = MemoryCatalog::new()
            .with("a.txt", &b"abc"[..])
            .with("b.bin", vec![7u8; 1000]);
        let (server, addr) = spawn_server(catalog).await;

        let mut client = Client::connect(Config::default(), addr).await.unwrap();
        assert!(client.is_connected());
        assert!(client.catalog().is_none());

        let text = client.request_info().await.unwrap();
        assert_eq!(text, "a.txt - 3 Bytes\nb.bin - 1000 Bytes\n");
        assert_eq!(
            client.catalog().unwrap(),
            &[CatalogEntry::new("a.txt", 3), CatalogEntry::new("b.bin", 1000)]
        );

        client.disconnect().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_file_refused_locally() {
        let (server, addr) = spawn_server(MemoryCatalog::new().with("a.txt", &b"abc"[..])).await;
        let dir = tempfile::tempdir().unwrap();

        let mut client = Client::connect(Config::default(), addr).await.unwrap();
        for name in ["missing.bin", "../a.txt"] {
            let result = client.request_file(name, dir.path()).await;
            assert!(matches!(result, Err(Error::UnknownArtifact { .. })), "{name}");
        }
        assert!(!dir.path().join("missing.bin").exists());

        let report = client.request_file("a.txt", dir.path()).await.unwrap();
        assert_eq!(report.bytes, 3);
        assert_eq!(std::fs::read(&report.path).unwrap(), b"abc");

        client.disconnect().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_stall_against_silent_peer() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            stall_timeout_ms: Some(200),
            ..Config::default()
        };

        let mut client = Client::bind(config, silent.local_addr().unwrap())
            .await
            .unwrap();
        let result = client.request_info().await;
        assert!(matches!(result, Err(Error::TransferStall { pending: 0, .. })));
    }
}
