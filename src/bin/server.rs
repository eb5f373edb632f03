//! CTP 서버 - Catalog Transfer Protocol
//!
//! 디렉터리의 파일 목록을 제공하고 요청받은 파일을 전송
//! - 엔드포인트별 세션, 확인되지 않은 청크 일괄 재전송
//!
//! 사용법:
//!   cargo run --release --bin ctp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 디렉터리("Downloadable Files") 제공
//!   cargo run --release --bin ctp-server
//!
//!   # 다른 디렉터리, LAN 설정
//!   cargo run --release --bin ctp-server -- --dir ./share --profile lan

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ctp::catalog::{Catalog, DirectoryCatalog, DEFAULT_CATALOG_DIR};
use ctp::{Config, Server, DEFAULT_PORT};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    dir: PathBuf,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            dir: PathBuf::from(DEFAULT_CATALOG_DIR),
            config: Config::default(),
        }
    }
}

/// 옵션 값 파싱. 실패 시 종료
fn parse_value<T: FromStr>(flag: &str, value: Option<&String>) -> T {
    match value.map(|v| v.parse()) {
        Some(Ok(parsed)) => parsed,
        _ => {
            eprintln!("{flag}: 유효한 값 필요");
            std::process::exit(2);
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                config.bind_addr = parse_value("--bind", args.get(i + 1));
                i += 1;
            }
            "--dir" | "-d" => {
                config.dir = parse_value("--dir", args.get(i + 1));
                i += 1;
            }
            "--profile" => {
                let bind_port = config.bind_addr.port();
                config.config = match args.get(i + 1).map(String::as_str) {
                    Some("lan") => Config::lan(),
                    Some("unreliable") => Config::unreliable_network(),
                    Some("default") => Config::default(),
                    _ => {
                        eprintln!("--profile: lan | unreliable | default");
                        std::process::exit(2);
                    }
                };
                config.config.port = bind_port;
                i += 1;
            }
            "--stall-timeout" => {
                config.config.stall_timeout_ms =
                    Some(parse_value("--stall-timeout", args.get(i + 1)));
                i += 1;
            }
            "--retransmit-interval" => {
                config.config.retransmit_interval_ms =
                    parse_value("--retransmit-interval", args.get(i + 1));
                i += 1;
            }
            "--metadata-first" => {
                config.config.await_metadata_ack = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"CTP Server - Catalog Transfer Protocol 서버

디렉터리의 파일 목록을 제공하고 요청받은 파일을 UDP로 전송
- 모든 청크에 수신 확인, 미확인 청크는 주기적으로 재전송

사용법:
  cargo run --release --bin ctp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>               바인드 주소 (기본: 0.0.0.0:9091)
  -d, --dir <PATH>                제공할 디렉터리 (기본: "Downloadable Files")
  --profile <NAME>                설정 프리셋: lan | unreliable | default
  --stall-timeout <MS>            진행 없는 전송 포기 시간 (기본: 무제한)
  --retransmit-interval <MS>      재전송 주기 (기본: 5)
  --metadata-first                METADATA 확인 후 데이터 전송
  -h, --help                      이 도움말 출력

예시:
  # LAN 환경
  cargo run --release --bin ctp-server -- --dir ./share --profile lan

  # 불안정한 네트워크, 60초 후 포기
  cargo run --release --bin ctp-server -- --profile unreliable --stall-timeout 60000
"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션 무시: {other}");
            }
        }
        i += 1;
    }

    config.config.port = config.bind_addr.port();
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let config = server_config.config.clone();

    info!("CTP Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Serving directory: {:?}", server_config.dir);
    info!("Max chunk size: {} bytes", config.max_chunk_size());
    info!("Retransmit interval: {:?}", config.retransmit_interval());
    match config.stall_timeout() {
        Some(limit) => info!("Stall timeout: {:?}", limit),
        None => info!("Stall timeout: unbounded"),
    }

    let catalog = DirectoryCatalog::new(&server_config.dir);
    match catalog.entries() {
        Ok(entries) => info!("Catalog: {} files", entries.len()),
        Err(e) => warn!("카탈로그 디렉터리를 읽을 수 없음 {:?}: {}", server_config.dir, e),
    }

    let server = Arc::new(
        Server::bind_addr(server_config.bind_addr, config, Arc::new(catalog)).await?,
    );

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.stop();
        }
    });

    server.run().await?;
    Ok(())
}
