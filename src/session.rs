//! 세션 관리 (서버측)
//!
//! - 원격 엔드포인트마다 독립된 세션 (핸드쉐이크 상태, 미확인 테이블, 수신 큐)
//! - 세션마다 처리 태스크와 재전송 태스크가 세션 수명 동안 실행
//! - RECEIVED는 큐를 거치지 않고 즉시 미확인 테이블에 반영
//! - DISCONNECT는 요청 처리 중(METADATA 확인 대기 등)에도 세션을 끝냄

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::catalog::{render_listing, Catalog};
use crate::handshake::{Handshake, HandshakeState};
use crate::link::Link;
use crate::packet::Packet;
use crate::sender::{PendingTable, ReliableSender, Retransmitter};
use crate::{Config, Error, Result};

type SessionMap = DashMap<SocketAddr, Arc<SessionHandle>>;

/// 세션 핸들 (수신 루프에서 패킷 전달용)
pub struct SessionHandle {
    addr: SocketAddr,
    inbox: mpsc::Sender<Packet>,
    pending: Arc<PendingTable>,
    running: Arc<AtomicBool>,
    closing: Arc<Notify>,
}

impl SessionHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 세션의 미확인 송신 테이블
    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 패킷 전달
    ///
    /// RECEIVED는 즉시 테이블에 반영하고 나머지는 처리 큐에 넣음.
    /// 큐가 가득 차면 버림 (상대가 재전송함). DISCONNECT는 처리 중인
    /// 요청도 중단시킴.
    pub fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Received { seq } => {
                self.pending.acknowledge(seq);
            }
            other => {
                if matches!(other, Packet::Disconnect) {
                    self.closing.notify_one();
                }
                if let Err(e) = self.inbox.try_send(other) {
                    debug!("{} 세션 큐에 넣지 못함: {}", self.addr, e);
                }
            }
        }
    }
}

/// 세션 레지스트리
///
/// 엔드포인트 → 세션 맵. 같은 엔드포인트의 첫 패킷이 동시에 도착해도
/// 세션은 하나만 생성됨.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    socket: Arc<UdpSocket>,
    config: Config,
    catalog: Arc<dyn Catalog>,
}

impl SessionRegistry {
    pub fn new(socket: Arc<UdpSocket>, config: Config, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            socket,
            config,
            catalog,
        }
    }

    /// 세션 조회 또는 생성
    pub fn get_or_create(&self, addr: SocketAddr) -> Arc<SessionHandle> {
        self.sessions
            .entry(addr)
            .or_insert_with(|| self.spawn(addr))
            .value()
            .clone()
    }

    /// 수신 패킷을 해당 세션으로 전달
    ///
    /// 알 수 없는 엔드포인트의 RECEIVED/DISCONNECT는 종료된 세션의 잔여
    /// 패킷이므로 세션을 만들지 않고 버림
    pub fn dispatch(&self, addr: SocketAddr, packet: Packet) {
        if matches!(packet, Packet::Received { .. } | Packet::Disconnect) {
            match self.get(addr) {
                Some(handle) => handle.dispatch(packet),
                None => debug!("세션 없는 {}의 {} 무시", addr, packet.packet_type()),
            }
            return;
        }

        self.get_or_create(addr).dispatch(packet);
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&addr).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 활성 세션 주소 목록
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// 모든 세션 종료
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().running.store(false, Ordering::SeqCst);
        }
        // 핸들이 사라지면 수신 큐가 닫혀 처리 태스크가 종료됨
        self.sessions.clear();
    }

    fn spawn(&self, addr: SocketAddr) -> Arc<SessionHandle> {
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.session_queue_len.max(1));
        let pending = Arc::new(PendingTable::new());
        let running = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(Notify::new());

        let handle = Arc::new(SessionHandle {
            addr,
            inbox: inbox_tx,
            pending: pending.clone(),
            running: running.clone(),
            closing: closing.clone(),
        });

        let session = Session {
            link: Link::new(self.socket.clone(), addr),
            inbox: inbox_rx,
            pending,
            handshake: Handshake::new(&self.config),
            catalog: self.catalog.clone(),
            config: self.config.clone(),
            running,
            closing,
            active: None,
        };

        debug!("새 세션: {}", addr);
        tokio::spawn(session.run(Arc::downgrade(&handle), self.sessions.clone()));

        handle
    }
}

/// 패킷 처리 후 흐름
enum Flow {
    Continue,
    Teardown,
}

/// 세션 처리 태스크 상태
struct Session {
    link: Link,
    inbox: mpsc::Receiver<Packet>,
    pending: Arc<PendingTable>,
    handshake: Handshake,
    catalog: Arc<dyn Catalog>,
    config: Config,
    running: Arc<AtomicBool>,

    /// DISCONNECT 수신 알림
    closing: Arc<Notify>,

    /// 전송 중인 요청 (요청 재전송 중복 판별용)
    active: Option<Packet>,
}

impl Session {
    async fn run(mut self, handle: Weak<SessionHandle>, sessions: Arc<SessionMap>) {
        let addr = self.link.peer();
        let idle_wait = self.config.idle_wait();
        let closing = self.closing.clone();
        let mut retransmit = tokio::spawn(
            Retransmitter::new(
                self.link.clone(),
                self.pending.clone(),
                &self.config,
                self.running.clone(),
            )
            .run(),
        );

        while self.running.load(Ordering::SeqCst) {
            let packet = tokio::select! {
                received = tokio::time::timeout(idle_wait, self.inbox.recv()) => match received {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    // 유휴 대기 만료: 루프 재진입만 함
                    Err(_) => continue,
                },
                result = &mut retransmit => {
                    log_retransmit_end(addr, result);
                    break;
                }
                _ = closing.notified() => break,
            };

            let flow = tokio::select! {
                flow = self.handle(packet) => flow,
                result = &mut retransmit => {
                    log_retransmit_end(addr, result);
                    break;
                }
                _ = closing.notified() => {
                    debug!("{} 처리 중 DISCONNECT 수신", addr);
                    break;
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Teardown) => break,
                Err(e) => {
                    warn!("{} 세션 에러: {}", addr, e);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.handshake.disconnect();
        let abandoned = self.pending.clear();
        retransmit.abort();

        sessions.remove_if(&addr, |_, current| Arc::as_ptr(current) == handle.as_ptr());

        info!(
            "Session closed: {} (abandoned {}) | {}",
            addr,
            abandoned,
            self.pending.stats().summary()
        );
    }

    async fn handle(&mut self, packet: Packet) -> Result<Flow> {
        match packet {
            Packet::Disconnect => {
                debug!("{} DISCONNECT 수신", self.link.peer());
                Ok(Flow::Teardown)
            }

            Packet::Connect => {
                if self.handshake.state() != HandshakeState::Disconnected {
                    debug!("{} 이미 연결됨, CONNECT 무시", self.link.peer());
                    return Ok(Flow::Continue);
                }

                match self.handshake.accept(&self.link, &mut self.inbox).await {
                    Ok(proof) => Ok(self.serve(proof).await),
                    Err(Error::HandshakeTimeout { .. }) | Err(Error::ConnectionClosed) => {
                        Ok(Flow::Teardown)
                    }
                    Err(e) => Err(e),
                }
            }

            request @ (Packet::RequestInfo | Packet::RequestFile { .. }) => {
                Ok(self.serve(request).await)
            }

            other => {
                debug!("{} 처리 대상 아님: {}", self.link.peer(), other.packet_type());
                Ok(Flow::Continue)
            }
        }
    }

    /// 요청 처리: 새 전송을 미확인 테이블에 등록
    async fn serve(&mut self, request: Packet) -> Flow {
        if self.active.as_ref() == Some(&request) && !self.pending.is_empty() {
            debug!("{} 전송 중인 요청의 재전송 무시", self.link.peer());
            return Flow::Continue;
        }

        // 클라이언트는 한 번에 하나의 전송만 받으므로 이전 전송은 끝난 것으로 봄
        let abandoned = self.pending.clear();
        if abandoned > 0 {
            debug!("{} 이전 전송 항목 {}개 폐기", self.link.peer(), abandoned);
        }
        self.active = None;

        let sender = ReliableSender::new(self.pending.clone(), &self.config);
        let result = match &request {
            Packet::RequestInfo => self.send_listing(&sender).await,
            Packet::RequestFile { name } => self.send_file(&sender, name).await,
            _ => Ok(()),
        };

        match result {
            Ok(()) => self.active = Some(request),
            Err(e) => {
                warn!("{} 요청 처리 실패: {}", self.link.peer(), e);
                self.pending.clear();
            }
        }

        Flow::Continue
    }

    async fn send_listing(&self, sender: &ReliableSender) -> Result<()> {
        let entries = self.catalog.entries()?;
        let listing = render_listing(&entries);

        info!(
            "Sending info to {}: {} files, {} bytes",
            self.link.peer(),
            entries.len(),
            listing.len()
        );
        sender.send_whole(listing.as_bytes()).await?;
        Ok(())
    }

    async fn send_file(&self, sender: &ReliableSender, name: &str) -> Result<()> {
        // 없는 파일은 거부 패킷 없이 무시 (클라이언트가 목록으로 사전 검증)
        let source = self.catalog.open(name)?;

        info!(
            "Sending file {} ({} bytes) to {}",
            name,
            source.len,
            self.link.peer()
        );
        sender.send_stream(source.reader, source.len).await?;
        Ok(())
    }
}

fn log_retransmit_end(addr: SocketAddr, result: std::result::Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("{} 재전송 루프 종료", addr),
        Ok(Err(e)) => warn!("{} 세션 종료: {}", addr, e),
        Err(e) => warn!("{} 재전송 태스크 에러: {}", addr, e),
    }
}
