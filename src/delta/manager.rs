//! FilePartsRecord 서비스
//!
//! 파일 버전별 record 를 계산하고 캐시한다. 서로 다른 파일은 동시에 계산 가능.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::record::{FilePartsRecord, RecordBuilder};
use crate::peer::FileInfo;
use crate::{Config, Error, Result};

/// 캐시 최대 항목 수
const MAX_CACHED_RECORDS: usize = 256;

/// 진행률 콜백
pub type ProgressListener = Arc<dyn Fn(f64) + Send + Sync>;

/// record 계산/캐시 관리자
pub struct FileRecordManager {
    config: Config,
    pool: Arc<rayon::ThreadPool>,
    cache: DashMap<FileInfo, Arc<FilePartsRecord>>,
}

impl FileRecordManager {
    pub fn new(config: Config) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.hash_workers)
            .thread_name(|i| format!("swarm-hash-{i}"))
            .build()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        Ok(Self {
            config,
            pool: Arc::new(pool),
            cache: DashMap::new(),
        })
    }

    /// `file` 버전의 record 반환 (없으면 `path` 에서 계산)
    ///
    /// 디스크 파일 크기가 `file.size` 와 다르면 파일이 바뀐 것으로 보고 실패한다.
    pub async fn retrieve_record(
        &self,
        file: &FileInfo,
        path: PathBuf,
        progress: ProgressListener,
    ) -> Result<Arc<FilePartsRecord>> {
        if let Some(record) = self.cache.get(file) {
            progress(1.0);
            return Ok(record.clone());
        }

        let builder = RecordBuilder::new(
            self.config.record_block_size(file.size),
            self.pool.clone(),
        );
        let expected = file.size;

        let record = tokio::task::spawn_blocking(move || -> Result<FilePartsRecord> {
            let handle = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::FileNotFound(path));
                }
                Err(e) => return Err(e.into()),
            };
            let actual = handle.metadata()?.len();
            if actual != expected {
                return Err(Error::Transfer(format!(
                    "파일 크기 변경됨 '{}': expected {}, actual {}",
                    path.display(),
                    expected,
                    actual
                )));
            }
            let reader = std::io::BufReader::new(handle);
            Ok(builder.build(reader, expected, progress.as_ref())?)
        })
        .await
        .map_err(|e| Error::Transfer(format!("record 계산 태스크 실패: {e}")))??;

        let record = Arc::new(record);
        self.store(file, record.clone());

        debug!(
            "record 계산 완료: {} ({} blocks x {} bytes)",
            file.name,
            record.block_count(),
            record.block_size()
        );
        Ok(record)
    }

    /// 블록 해시용 스레드 풀 (다운로드 측 매칭에서도 공유)
    pub fn pool(&self) -> Arc<rayon::ThreadPool> {
        self.pool.clone()
    }

    /// 같은 파일의 다른 버전 record 제거
    pub fn invalidate(&self, file: &FileInfo) {
        self.cache.retain(|cached, _| !cached.is_same_file(file));
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn store(&self, file: &FileInfo, record: Arc<FilePartsRecord>) {
        self.invalidate(file);
        if self.cache.len() >= MAX_CACHED_RECORDS {
            self.cache.clear();
        }
        self.cache.insert(file.clone(), record);
    }
}
