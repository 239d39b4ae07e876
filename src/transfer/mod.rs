//! 파일 단위 업로드/다운로드 세션과 세션 코디네이터

pub mod download;
pub mod manager;
pub mod parts;
pub mod queue;
pub mod state;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bandwidth::BandwidthLimiter;
use crate::delta::FileRecordManager;
use crate::network::{FolderRepository, PeerNetwork};
use crate::stats::TransferStats;
use crate::{Config, Result};

pub use download::Download;
pub use manager::{Direction, TransferEvent, TransferManager};
pub use parts::{ChunkOutcome, PartsTracker};
pub use queue::{PendingRequests, UploadRequest};
pub use state::{Outcome, StatusHandle, TransferState, TransferStatus};
pub use upload::Upload;

/// 세션들이 공유하는 협력자와 설정
pub struct TransferContext {
    pub config: Config,
    pub network: Arc<dyn PeerNetwork>,
    pub repository: Arc<dyn FolderRepository>,
    pub records: FileRecordManager,
    pub limiter: BandwidthLimiter,
    pub stats: Mutex<TransferStats>,
}

impl TransferContext {
    pub fn new(
        config: Config,
        network: Arc<dyn PeerNetwork>,
        repository: Arc<dyn FolderRepository>,
    ) -> Result<Self> {
        Ok(Self {
            records: FileRecordManager::new(config.clone())?,
            limiter: BandwidthLimiter::new(config.upload_rate_limit),
            stats: Mutex::new(TransferStats::new(config.stats_window_size)),
            config,
            network,
            repository,
        })
    }
}
