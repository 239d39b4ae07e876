//! # Swarm Transfer
//!
//! P2P 폴더 동기화용 청크 전송 코어
//!
//! ## 핵심 특징
//! - **요청 기반 전송**: 다운로드 측이 RequestPart 로 필요한 구간만 요청
//! - **부분 전송**: 블록 체크섬(FilePartsRecord) 비교로 로컬에 있는 블록 재사용
//! - **NAT 통과**: 릴레이를 거친 SYN/ACK 핸드쉐이크 + UDP 홀 펀칭
//! - **포트 슬롯**: 범위 내 UDP 포트를 노드별로 배타 할당
//! - **백프레셔**: 업로드 측 요청 큐 상한, 동시 세션 수 제한

pub mod bandwidth;
pub mod channel;
pub mod config;
pub mod delta;
pub mod error;
pub mod message;
pub mod nat;
pub mod network;
pub mod node;
pub mod peer;
pub mod range;
pub mod stats;
pub mod transfer;

pub use bandwidth::BandwidthLimiter;
pub use channel::TcpNetwork;
pub use config::Config;
pub use delta::{FileMatcher, FilePartsRecord, FileRecordManager};
pub use error::{Error, Result, TransferProblem};
pub use message::{Message, UdtMessage};
pub use nat::{PortAllocator, PortSlot, UdtConnection, UdtConnectionManager};
pub use network::{FolderRepository, LocalFolder, PeerNetwork};
pub use node::Node;
pub use peer::{FileInfo, PeerId};
pub use range::Range;
pub use stats::TransferStats;
pub use transfer::{Download, TransferEvent, TransferManager, TransferState, Upload};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 FileChunk 최대 크기 (바이트)
pub const DEFAULT_MAX_FILE_CHUNK_SIZE: u64 = 32 * 1024; // 32KB

/// 기본 NAT 통과 포트 범위 시작
pub const DEFAULT_UDT_PORT_RANGE_START: u64 = 47_000;

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x53575250; // "SWRP"
