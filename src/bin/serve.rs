//! Swarm 서빙 노드 (업로드 측)
//!
//! 폴더 하나를 공유하고, 접속한 노드의 다운로드 요청에 응답한다.
//! 다른 노드 간 NAT 통과 핸드쉐이크의 릴레이 역할도 한다.
//!
//! 사용법:
//!   cargo run --release --bin swarm-serve -- [OPTIONS]
//!
//! 예시:
//!   # 폴더 공유 + 파일 descriptor 출력
//!   cargo run --release --bin swarm-serve -- --folder ./share --file movie.mkv
//!
//!   # 업로드 10MB/s 제한
//!   cargo run --release --bin swarm-serve -- -d ./share -f a.bin --rate-limit 10000000

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use swarm::channel::NetworkEvent;
use swarm::{Config, LocalFolder, Node, PeerId, TcpNetwork};

/// 서빙 노드 설정
struct ServeConfig {
    bind_addr: SocketAddr,
    peer_id: PeerId,
    folder_id: String,
    folder: PathBuf,
    files: Vec<String>,
    config: Config,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".parse().unwrap(),
            peer_id: PeerId::generate(),
            folder_id: "default".to_string(),
            folder: PathBuf::from("."),
            files: Vec::new(),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--id" => {
                if i + 1 < args.len() {
                    config.peer_id = PeerId::new(&args[i + 1]);
                    i += 1;
                }
            }
            "--folder" | "-d" => {
                if i + 1 < args.len() {
                    config.folder = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--folder-id" => {
                if i + 1 < args.len() {
                    config.folder_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.files.push(args[i + 1].clone());
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    config.config.max_file_chunk_size =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rate-limit" => {
                if i + 1 < args.len() {
                    config.config.upload_rate_limit = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--uploads" => {
                if i + 1 < args.len() {
                    config.config.max_concurrent_uploads =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--lan" => {
                config.config = Config::lan();
            }
            "--no-udt" => {
                config.config.udt_connections_enabled = false;
            }
            "--help" | "-h" => {
                println!(
                    r#"Swarm Serve - 폴더 공유 노드

요청 기반 청크 전송 + 블록 체크섬 부분 전송
- 접속한 노드의 RequestPart 에 FileChunk 로 응답
- 다른 노드 간 NAT 통과 핸드쉐이크 중계

사용법:
  cargo run --release --bin swarm-serve -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9100)
  --id <ID>               노드 ID (기본: 무작위)
  -d, --folder <DIR>      공유 폴더 경로 (기본: .)
  --folder-id <ID>        공유 폴더 ID (기본: default)
  -f, --file <NAME>       descriptor 를 출력할 파일 (여러 번 가능)
  --chunk-size <SIZE>     FileChunk 최대 크기 바이트 (기본: 32768)
  --rate-limit <BPS>      업로드 속도 제한 bytes/s (기본: 0 = 무제한)
  --uploads <N>           동시 업로드 수 (기본: 8)
  --lan                   LAN 프리셋 사용
  --no-udt                NAT 통과 연결 거부
  -h, --help              이 도움말 출력

예시:
  cargo run --release --bin swarm-serve -- -d ./share -f movie.mkv
  cargo run --release --bin swarm-fetch -- -s 127.0.0.1:9100 -d ./inbox --descriptor <출력된 descriptor>
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let serve_config = parse_args();

    info!("Swarm Serve starting...");
    info!("Node ID: {}", serve_config.peer_id);
    info!("Folder: {} -> {:?}", serve_config.folder_id, serve_config.folder);
    info!("Max chunk size: {} bytes", serve_config.config.max_file_chunk_size);

    let folder = Arc::new(LocalFolder::new(
        serve_config.folder_id.clone(),
        serve_config.folder.clone(),
    ));
    for name in &serve_config.files {
        match folder.file_info(name, 1) {
            Ok(file) => println!("{}", file),
            Err(e) => warn!("{} 정보 읽기 실패: {}", name, e),
        }
    }

    let (network, mut events) = TcpNetwork::new(serve_config.peer_id.clone());
    let node = Node::new(serve_config.config.clone(), network.clone(), folder)?;
    let _health = node.transfers().spawn_health_monitor();
    let (addr, _listener) = network.listen(serve_config.bind_addr).await?;
    info!("Listening on {}", addr);

    // 세션 종료 이벤트 로깅 (crossbeam 수신은 블로킹)
    let transfer_events = node.transfers().events();
    let transfers = node.transfers().clone();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = transfer_events.recv() {
            info!(
                "{:?} {} ({}) -> {:?}",
                event.direction, event.file.name, event.peer, event.outcome
            );
            info!("{}", transfers.stats().summary());
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::Connected(peer) => info!("Peer connected: {}", peer),
            NetworkEvent::Message(peer, message) => node.handle_message(&peer, message),
            NetworkEvent::Disconnected(peer) => {
                info!("Peer disconnected: {}", peer);
                node.peer_disconnected(&peer);
            }
        }
    }

    Ok(())
}
