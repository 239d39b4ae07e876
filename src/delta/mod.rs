//! 블록 체크섬 기반 부분 전송 (rsync 유사 delta)

pub mod manager;
pub mod matcher;
pub mod record;
pub mod rolling;

pub use manager::{FileRecordManager, ProgressListener};
pub use matcher::{BlockMatch, FileMatcher};
pub use record::{BlockChecksum, FilePartsRecord, RecordBuilder};
pub use rolling::RollingChecksum;
