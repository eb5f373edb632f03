//! CTP 클라이언트 - Catalog Transfer Protocol
//!
//! 서버에 연결해 파일 목록을 보여주고 입력한 파일을 다운로드
//!
//! 사용법:
//!   cargo run --release --bin ctp-client -- [OPTIONS]
//!
//! 예시:
//!   # 서버 주소를 실행 후 입력
//!   cargo run --release --bin ctp-client
//!
//!   # 서버 지정, 다른 저장 디렉터리
//!   cargo run --release --bin ctp-client -- --server 192.168.0.10 --output ./downloads

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ctp::client::DEFAULT_DOWNLOAD_DIR;
use ctp::{Client, Config, Error, DEFAULT_PORT};

/// 클라이언트 설정
struct ClientConfig {
    server: Option<String>,
    output_dir: PathBuf,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            output_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
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

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                config.server = Some(parse_value("--server", args.get(i + 1)));
                i += 1;
            }
            "--output" | "-o" => {
                config.output_dir = parse_value("--output", args.get(i + 1));
                i += 1;
            }
            "--profile" => {
                config.config = match args.get(i + 1).map(String::as_str) {
                    Some("lan") => Config::lan(),
                    Some("unreliable") => Config::unreliable_network(),
                    Some("default") => Config::default(),
                    _ => {
                        eprintln!("--profile: lan | unreliable | default");
                        std::process::exit(2);
                    }
                };
                i += 1;
            }
            "--stall-timeout" => {
                config.config.stall_timeout_ms =
                    Some(parse_value("--stall-timeout", args.get(i + 1)));
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"CTP Client - Catalog Transfer Protocol 클라이언트

서버의 파일 목록을 받아 입력한 파일을 다운로드

사용법:
  cargo run --release --bin ctp-client -- [OPTIONS]

옵션:
  -s, --server <HOST[:PORT]>  서버 주소 (생략 시 실행 후 입력, 기본 포트 9091)
  -o, --output <DIR>          저장 디렉터리 (기본: "Downloaded Files")
  --profile <NAME>            설정 프리셋: lan | unreliable | default
  --stall-timeout <MS>        진행 없는 전송 포기 시간 (기본: 무제한)
  -h, --help                  이 도움말 출력

파일 이름 입력 프롬프트에서 빈 줄 또는 "exit"을 입력하면 종료
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

    config
}

/// 주소 해석. 포트가 없으면 기본 포트 사용
async fn resolve(input: &str) -> std::io::Result<Option<SocketAddr>> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    if let Ok(ip) = input.parse::<std::net::IpAddr>() {
        return Ok(Some(SocketAddr::new(ip, DEFAULT_PORT)));
    }

    let target = if input.contains(':') {
        input.to_owned()
    } else {
        format!("{input}:{DEFAULT_PORT}")
    };
    Ok(tokio::net::lookup_host(target).await?.next())
}

async fn prompt(
    lines: &mut Lines<BufReader<Stdin>>,
    message: &str,
) -> std::io::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;

    Ok(lines.next_line().await?.map(|line| line.trim().to_owned()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let server_input = match client_config.server {
        Some(server) => server,
        None => match prompt(&mut lines, "Server IP: ").await? {
            Some(input) if !input.is_empty() => input,
            _ => return Ok(()),
        },
    };

    let server_addr = match resolve(&server_input).await? {
        Some(addr) => addr,
        None => {
            eprintln!("주소를 해석할 수 없음: {server_input}");
            std::process::exit(1);
        }
    };

    info!("Connecting to {}...", server_addr);
    let mut client = Client::connect(client_config.config, server_addr).await?;

    let listing = client.request_info().await?;
    println!("\nAvailable files:\n{listing}");

    loop {
        let name = match prompt(&mut lines, "File name (empty to exit): ").await? {
            Some(name) if !name.is_empty() && name != "exit" => name,
            _ => break,
        };

        match client.request_file(&name, &client_config.output_dir).await {
            Ok(report) => {
                println!(
                    "Received {} ({} bytes) in {:.3} seconds -> {}",
                    report.name,
                    report.bytes,
                    report.elapsed.as_secs_f64(),
                    report.path.display()
                );
                info!("{}", report.stats.summary());
            }
            Err(Error::UnknownArtifact { name }) => {
                println!("File not found: {name}");
            }
            Err(e) => {
                warn!("다운로드 실패: {}", e);
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
