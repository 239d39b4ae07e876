//! Swarm 다운로드 노드
//!
//! 서빙 노드에 접속해 descriptor 로 지정한 파일 하나를 받는다.
//! 로컬에 이전 버전이나 중단된 임시 파일이 있으면 블록 체크섬 비교로 재사용한다.
//!
//! 사용법:
//!   cargo run --release --bin swarm-fetch -- [OPTIONS]
//!
//! 예시:
//!   # 파일 받기
//!   cargo run --release --bin swarm-fetch -- -s 127.0.0.1:9100 -d ./inbox --descriptor default:a.bin:1048576:1700000000000:1
//!
//!   # 서버를 릴레이로 다른 노드와 NAT 통과 연결 시도
//!   cargo run --release --bin swarm-fetch -- -s 1.2.3.4:9100 --punch other-node

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use swarm::channel::NetworkEvent;
use swarm::transfer::{Direction, Outcome};
use swarm::{Config, FileInfo, LocalFolder, Node, PeerId, TcpNetwork};

/// 다운로드 노드 설정
struct FetchConfig {
    server_addr: SocketAddr,
    peer_id: PeerId,
    folder: PathBuf,
    descriptor: Option<FileInfo>,
    punch: Option<PeerId>,
    config: Config,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9100".parse().unwrap(),
            peer_id: PeerId::generate(),
            folder: PathBuf::from("."),
            descriptor: None,
            punch: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> FetchConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = FetchConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
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
            "--descriptor" => {
                if i + 1 < args.len() {
                    config.descriptor = Some(args[i + 1].parse().expect("유효한 descriptor 필요"));
                    i += 1;
                }
            }
            "--punch" => {
                if i + 1 < args.len() {
                    config.punch = Some(PeerId::new(&args[i + 1]));
                    i += 1;
                }
            }
            "--requests" => {
                if i + 1 < args.len() {
                    config.config.max_requests_queued = args[i + 1].parse().expect("유효한 숫자 필요");
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
            "--unstable" => {
                config.config = Config::unstable_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"Swarm Fetch - 파일 다운로드 노드

요청 기반 청크 수신 + 로컬 블록 재사용
- 최대 max_requests_queued 개의 RequestPart 를 동시에 유지
- 기존 파일/임시 파일이 있으면 FilePartsRecord 로 달라진 블록만 요청

사용법:
  cargo run --release --bin swarm-fetch -- [OPTIONS]

옵션:
  -s, --server <ADDR>     서빙 노드 주소 (기본: 127.0.0.1:9100)
  --id <ID>               노드 ID (기본: 무작위)
  -d, --folder <DIR>      저장 폴더 경로 (기본: .)
  --descriptor <DESC>     받을 파일 (swarm-serve 가 출력한 folder:name:size:modified:version)
  --punch <ID>            서버를 릴레이로 해당 노드와 NAT 통과 연결 시도
  --requests <N>          동시 RequestPart 수 (기본: 15)
  --chunk-size <SIZE>     FileChunk 최대 크기 바이트 (기본: 32768)
  --unstable              불안정 네트워크 프리셋 사용
  -h, --help              이 도움말 출력
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

    let fetch_config = parse_args();
    if fetch_config.descriptor.is_none() && fetch_config.punch.is_none() {
        error!("--descriptor 또는 --punch 필요 (--help 참고)");
        std::process::exit(2);
    }

    info!("Swarm Fetch starting...");
    info!("Node ID: {}", fetch_config.peer_id);
    info!("Server: {}", fetch_config.server_addr);

    let (network, mut events) = TcpNetwork::new(fetch_config.peer_id.clone());
    let folder_id = fetch_config
        .descriptor
        .as_ref()
        .map(|d| d.folder_id.clone())
        .unwrap_or_else(|| "default".to_string());
    let folder = Arc::new(LocalFolder::new(folder_id, fetch_config.folder.clone()));
    let node = Node::new(fetch_config.config.clone(), network.clone(), folder)?;
    let _health = node.transfers().spawn_health_monitor();

    let server = network.connect(fetch_config.server_addr).await?;
    network.set_relay(Some(server.clone()));
    info!("Connected to {}", server);

    // 네트워크 이벤트 분배 태스크
    let dispatcher = node.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::Connected(peer) => info!("Peer connected: {}", peer),
                NetworkEvent::Message(peer, message) => dispatcher.handle_message(&peer, message),
                NetworkEvent::Disconnected(peer) => {
                    warn!("Peer disconnected: {}", peer);
                    dispatcher.peer_disconnected(&peer);
                }
            }
        }
    });

    if let Some(target) = &fetch_config.punch {
        match node.connect(target).await {
            Ok(connection) => info!(
                "NAT 통과 성공: {} ({} <- local port {})",
                target,
                connection.remote_addr(),
                connection.local_port()
            ),
            Err(e) => warn!("NAT 통과 실패 ({}): {}", target, e),
        }
    }

    let Some(file) = fetch_config.descriptor else {
        return Ok(());
    };

    // crossbeam 이벤트를 tokio 쪽으로 옮김
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let transfer_events = node.transfers().events();
    std::thread::spawn(move || {
        while let Ok(event) = transfer_events.recv() {
            if done_tx.send(event).is_err() {
                break;
            }
        }
    });

    info!("Downloading {} ({} bytes)", file.name, file.size);
    let start = Instant::now();
    let download = node.transfers().start_download(&server, file.clone());

    while let Some(event) = done_rx.recv().await {
        if event.direction != Direction::Download || !event.file.is_same_file(&file) {
            continue;
        }

        let elapsed = start.elapsed();
        match event.outcome {
            Outcome::Completed => {
                let throughput = file.size as f64 / elapsed.as_secs_f64().max(1e-6) / 1_000_000.0;
                info!("Transfer complete!");
                info!("  Time: {:.2}s", elapsed.as_secs_f64());
                info!("  Received: {} bytes", download.bytes_received());
                info!("  Throughput: {:.2} MB/s", throughput);
                info!("{}", node.transfers().stats().summary());
            }
            Outcome::Broken(problem, message) => {
                error!("Transfer failed: {} ({})", problem, message);
                std::process::exit(1);
            }
            Outcome::Aborted => {
                warn!("Transfer aborted");
                std::process::exit(1);
            }
        }
        break;
    }

    network.disconnect(&server);
    Ok(())
}
