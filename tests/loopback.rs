//! 루프백 소켓 통합 테스트 (서버 + 클라이언트)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;

use ctp::catalog::{render_listing, Catalog, CatalogEntry, DirectoryCatalog, MemoryCatalog};
use ctp::{Client, Config, Error, Packet, Server};

async fn spawn_server(config: Config, catalog: Arc<dyn Catalog>) -> (Arc<Server>, SocketAddr) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = Arc::new(Server::bind_addr(addr, config, catalog).await.unwrap());
    let server_addr = server.local_addr().unwrap();

    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    (server, server_addr)
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// 클라이언트와 서버 사이의 중계 소켓
///
/// `armed`가 켜져 있으면 클라이언트의 RECEIVED(0) 하나를 버리고 꺼짐
async fn spawn_lossy_relay(
    server: SocketAddr,
    armed: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut client = None;

        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };

            if from == server {
                if let Some(client) = client {
                    let _ = socket.send_to(&buf[..len], client).await;
                }
                continue;
            }

            client = Some(from);
            let is_final_ack = matches!(
                Packet::from_bytes(&buf[..len]),
                Ok(Packet::Received { seq: 0 })
            );
            if is_final_ack && armed.swap(false, Ordering::SeqCst) {
                dropped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            let _ = socket.send_to(&buf[..len], server).await;
        }
    });

    relay_addr
}

async fn wait_for_sessions(server: &Server, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.registry().len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("세션 수 대기 시간 초과");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_multi_window_file() {
    let share = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();

    // 기본 읽기 윈도우(50,300 바이트)를 여러 번 넘는 크기
    let big = random_bytes(120_000, 7);
    std::fs::write(share.path().join("big.bin"), &big).unwrap();
    std::fs::write(share.path().join("a.txt"), b"abc").unwrap();
    std::fs::write(share.path().join("empty.dat"), b"").unwrap();

    let (server, addr) = spawn_server(
        Config::default(),
        Arc::new(DirectoryCatalog::new(share.path())),
    )
    .await;

    let mut client = Client::connect(Config::default(), addr).await.unwrap();

    let listing = client.request_info().await.unwrap();
    assert_eq!(
        listing,
        "a.txt - 3 Bytes\nbig.bin - 120000 Bytes\nempty.dat - 0 Bytes\n"
    );

    let report = client.request_file("big.bin", downloads.path()).await.unwrap();
    assert_eq!(report.bytes, 120_000);
    assert_eq!(report.stats.total_chunks, 239);
    assert_eq!(std::fs::read(downloads.path().join("big.bin")).unwrap(), big);

    // 같은 연결에서 연속 요청
    let report = client.request_file("a.txt", downloads.path()).await.unwrap();
    assert_eq!(report.bytes, 3);
    assert_eq!(std::fs::read(downloads.path().join("a.txt")).unwrap(), b"abc");

    let report = client.request_file("empty.dat", downloads.path()).await.unwrap();
    assert_eq!(report.bytes, 0);
    assert!(downloads.path().join("empty.dat").exists());

    client.disconnect().await.unwrap();
    wait_for_sessions(&server, 0).await;
    server.stop();
}

#[tokio::test]
async fn test_unknown_artifact_never_requested() {
    let catalog = MemoryCatalog::new().with("a.txt", &b"abc"[..]);
    let (server, addr) = spawn_server(Config::default(), Arc::new(catalog)).await;
    let downloads = tempfile::tempdir().unwrap();

    let mut client = Client::connect(Config::default(), addr).await.unwrap();
    client.request_info().await.unwrap();

    let result = client.request_file("nope.bin", downloads.path()).await;
    assert!(matches!(result, Err(Error::UnknownArtifact { ref name }) if name == "nope.bin"));
    assert!(!downloads.path().join("nope.bin").exists());

    // 세션은 계속 사용 가능
    let report = client.request_file("a.txt", downloads.path()).await.unwrap();
    assert_eq!(report.bytes, 3);

    client.disconnect().await.unwrap();
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_are_isolated() {
    let first = random_bytes(20_000, 1);
    let second = random_bytes(31_337, 2);
    let catalog = MemoryCatalog::new()
        .with("first.bin", first.clone())
        .with("second.bin", second.clone());
    let (server, addr) = spawn_server(Config::default(), Arc::new(catalog)).await;

    let downloads: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let tasks: Vec<_> = [("first.bin", first), ("second.bin", second)]
        .into_iter()
        .zip(downloads.iter().map(|dir| dir.path().to_path_buf()))
        .map(|((name, expected), dir)| {
            tokio::spawn(async move {
                let mut client = Client::connect(Config::default(), addr).await.unwrap();
                let report = client.request_file(name, &dir).await.unwrap();
                assert_eq!(std::fs::read(dir.join(name)).unwrap(), expected);
                client.disconnect().await.unwrap();
                report.bytes
            })
        })
        .collect();

    let mut totals = Vec::new();
    for task in tasks {
        totals.push(task.await.unwrap());
    }
    assert_eq!(totals, vec![20_000, 31_337]);

    wait_for_sessions(&server, 0).await;
    server.stop();
}

#[tokio::test]
async fn test_metadata_first_ordering() {
    let payload = random_bytes(5_000, 3);
    let config = Config {
        await_metadata_ack: true,
        ..Config::default()
    };
    let catalog = MemoryCatalog::new().with("m.bin", payload.clone());
    let (server, addr) = spawn_server(config.clone(), Arc::new(catalog)).await;
    let downloads = tempfile::tempdir().unwrap();

    let mut client = Client::connect(config, addr).await.unwrap();
    let report = client.request_file("m.bin", downloads.path()).await.unwrap();
    assert_eq!(report.bytes, 5_000);
    assert_eq!(std::fs::read(&report.path).unwrap(), payload);

    client.disconnect().await.unwrap();
    server.stop();
}

/// 손으로 패킷을 주고받는 원시 클라이언트로 서버 동작 확인
#[tokio::test]
async fn test_raw_protocol_exchange() {
    let entries = [CatalogEntry::new("a.txt", 3), CatalogEntry::new("b.bin", 1000)];
    let catalog = MemoryCatalog::new()
        .with("a.txt", vec![1u8; 3])
        .with("b.bin", vec![0u8; 1000]);
    let (server, addr) = spawn_server(Config::default(), Arc::new(catalog)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 1024];

    // CONNECT → ACK
    socket.send_to(&Packet::Connect.to_bytes(), addr).await.unwrap();
    let (len, _) = socket.recv_from(&mut buf).await.unwrap();
    assert_eq!(Packet::from_bytes(&buf[..len]).unwrap(), Packet::Ack);

    // REQUEST_INFO가 핸드쉐이크를 완료하고 그대로 처리됨
    socket
        .send_to(&Packet::RequestInfo.to_bytes(), addr)
        .await
        .unwrap();

    let expected = render_listing(&entries);
    let mut metadata = None;
    let mut content = None;

    tokio::time::timeout(Duration::from_secs(5), async {
        while metadata.is_none() || content.is_none() {
            let (len, _) = socket.recv_from(&mut buf).await.unwrap();
            match Packet::from_bytes(&buf[..len]).unwrap() {
                Packet::Metadata { total_len } => {
                    metadata = Some(total_len);
                    socket
                        .send_to(&Packet::metadata_received().to_bytes(), addr)
                        .await
                        .unwrap();
                }
                Packet::Data { seq, content: data } => {
                    assert_eq!(seq, 0);
                    content = Some(data);
                    socket
                        .send_to(&Packet::Received { seq }.to_bytes(), addr)
                        .await
                        .unwrap();
                }
                // 확인 전 재전송된 ACK
                Packet::Ack => {}
                other => panic!("예상하지 못한 패킷: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(metadata, Some(expected.len() as u32));
    assert_eq!(content.unwrap(), expected.as_bytes());

    // 확인 후에는 해당 항목이 테이블에서 빠짐
    let session = server.registry().get(socket.local_addr().unwrap()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !session.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    socket
        .send_to(&Packet::Disconnect.to_bytes(), addr)
        .await
        .unwrap();
    wait_for_sessions(&server, 0).await;
    server.stop();
}

/// 마지막 RECEIVED가 유실되어도 같은 파일을 다시 받을 수 있어야 함
#[tokio::test]
async fn test_repeat_download_after_lost_final_ack() {
    let catalog = MemoryCatalog::new().with("a.txt", &b"abc"[..]);
    let (server, addr) = spawn_server(Config::default(), Arc::new(catalog)).await;

    let armed = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicUsize::new(0));
    let relay = spawn_lossy_relay(addr, armed.clone(), dropped.clone()).await;

    let config = Config {
        stall_timeout_ms: Some(2_000),
        ..Config::default()
    };
    let downloads = tempfile::tempdir().unwrap();
    let mut client = Client::connect(config, relay).await.unwrap();
    client.request_info().await.unwrap();

    // 첫 다운로드의 유일한 DATA 확인을 버림
    armed.store(true, Ordering::SeqCst);
    let first = client.request_file("a.txt", downloads.path()).await.unwrap();
    assert_eq!(first.bytes, 3);
    tokio::time::timeout(Duration::from_secs(2), async {
        while dropped.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("RECEIVED(0)이 중계되지 않음");

    let second = tokio::time::timeout(
        Duration::from_secs(5),
        client.request_file("a.txt", downloads.path()),
    )
    .await
    .expect("재다운로드 대기 시간 초과")
    .unwrap();
    assert_eq!(second.bytes, 3);
    assert_eq!(std::fs::read(&second.path).unwrap(), b"abc");

    // 재전송된 항목도 수신 태스크가 확인해 서버 테이블이 비워짐
    wait_for_sessions(&server, 1).await;
    let session = server.registry().addrs()[0];
    let session = server.registry().get(session).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !session.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("미확인 항목이 남아 있음");

    client.disconnect().await.unwrap();
    wait_for_sessions(&server, 0).await;
    server.stop();
}
