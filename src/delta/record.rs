//! FilePartsRecord: 파일의 블록별 체크섬 목록
//!
//! 블록마다 rolling checksum (빠른 후보 검색) + BLAKE3 (확정 비교) 를 가진다.
//! 파일 전체 BLAKE3 digest 도 함께 보관해 다운로드 완료 후 검증에 쓴다.

use std::io::Read;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::rolling;
use crate::range::Range;
use crate::{Error, Result};

/// 한 번에 해시하는 블록 수 (진행률 보고 단위)
const BATCH_BLOCKS: usize = 64;

/// 블록 체크섬
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockChecksum {
    pub rolling: u32,
    pub strong: [u8; 32],
}

impl BlockChecksum {
    pub fn of(block: &[u8]) -> Self {
        Self {
            rolling: rolling::checksum(block),
            strong: *blake3::hash(block).as_bytes(),
        }
    }
}

/// 파일 한 버전의 블록 체크섬 목록 (계산 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePartsRecord {
    file_length: u64,
    block_size: u32,
    blocks: Vec<BlockChecksum>,
    digest: [u8; 32],
}

impl FilePartsRecord {
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn blocks(&self) -> &[BlockChecksum] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// 파일 전체 BLAKE3 digest
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// i 번째 블록이 덮는 파일 구간 (마지막 블록은 짧을 수 있음)
    pub fn block_range(&self, index: usize) -> Range {
        let start = index as u64 * self.block_size as u64;
        let end = start
            .saturating_add(self.block_size as u64)
            .min(self.file_length);
        Range::new(start, end.saturating_sub(start))
    }

    /// 상대에게서 받은 record 구조 검증
    ///
    /// 블록 크기는 `1..=max_block_size`, 블록 수는 파일 길이로 계산한 값과 같아야 한다.
    pub fn validate(&self, max_block_size: u32) -> Result<()> {
        if self.block_size == 0 || self.block_size > max_block_size {
            return Err(Error::Transfer(format!(
                "record 블록 크기 범위 밖: {} (최대 {})",
                self.block_size, max_block_size
            )));
        }
        let expected = self.file_length.div_ceil(self.block_size as u64);
        if self.blocks.len() as u64 != expected {
            return Err(Error::Transfer(format!(
                "record 블록 수 불일치: {} != {}",
                self.blocks.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// FilePartsRecord 계산기
pub struct RecordBuilder {
    block_size: u32,
    pool: Arc<rayon::ThreadPool>,
}

impl RecordBuilder {
    pub fn new(block_size: u32, pool: Arc<rayon::ThreadPool>) -> Self {
        Self {
            block_size: block_size.max(1),
            pool,
        }
    }

    /// `reader` 에서 정확히 `file_length` 바이트를 읽어 record 계산
    ///
    /// 배치마다 `progress` 에 0.0 ~ 1.0 진행률을 알린다.
    /// 파일이 도중에 짧아지면 `UnexpectedEof`.
    pub fn build<R: Read>(
        &self,
        mut reader: R,
        file_length: u64,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> std::io::Result<FilePartsRecord> {
        let block_size = self.block_size as usize;
        let block_count = ((file_length + block_size as u64 - 1) / block_size as u64) as usize;

        let mut blocks = Vec::with_capacity(block_count);
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; block_size * BATCH_BLOCKS];
        let mut done: u64 = 0;

        while done < file_length {
            let want = ((file_length - done) as usize).min(buf.len());
            reader.read_exact(&mut buf[..want])?;
            let batch = &buf[..want];

            hasher.update(batch);
            let checksums: Vec<BlockChecksum> = self.pool.install(|| {
                batch
                    .par_chunks(block_size)
                    .map(BlockChecksum::of)
                    .collect()
            });
            blocks.extend(checksums);

            done += want as u64;
            progress(done as f64 / file_length as f64);
        }

        if file_length == 0 {
            progress(1.0);
        }

        Ok(FilePartsRecord {
            file_length,
            block_size: self.block_size,
            blocks,
            digest: *hasher.finalize().as_bytes(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_pool() -> Arc<rayon::ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;

    #[test]
    fn test_record_layout() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let builder = RecordBuilder::new(4096, test_pool());

        let record = builder
            .build(Cursor::new(&data), data.len() as u64, &|_: f64| {})
            .unwrap();

        assert_eq!(record.block_count(), 3);
        assert_eq!(record.block_range(2), Range::new(8192, 10_000 - 8192));
        assert_eq!(record.blocks()[0], BlockChecksum::of(&data[..4096]));
        assert_eq!(record.digest(), blake3::hash(&data).as_bytes());
    }

    #[test]
    fn test_progress_reaches_one() {
        let data = vec![1u8; 4096 * BATCH_BLOCKS * 2 + 10];
        let builder = RecordBuilder::new(4096, test_pool());
        let seen = Mutex::new(Vec::new());

        builder
            .build(Cursor::new(&data), data.len() as u64, &|p: f64| seen.lock().push(p))
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[test]
    fn test_short_file_is_error() {
        let builder = RecordBuilder::new(1024, test_pool());
        let err = builder
            .build(Cursor::new(vec![0u8; 100]), 200, &|_: f64| {})
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_empty_file() {
        let builder = RecordBuilder::new(1024, test_pool());
        let record = builder.build(Cursor::new(Vec::new()), 0, &|_: f64| {}).unwrap();
        assert_eq!(record.block_count(), 0);
        assert!(record.validate(1024).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_records() {
        let data = vec![7u8; 10_000];
        let built = RecordBuilder::new(4096, test_pool())
            .build(Cursor::new(&data), data.len() as u64, &|_: f64| {})
            .unwrap();
        assert!(built.validate(4096).is_ok());
        // 받는 쪽 상한보다 큰 블록
        assert!(built.validate(2048).is_err());

        let huge = FilePartsRecord {
            file_length: 10,
            block_size: u32::MAX,
            blocks: vec![BlockChecksum::of(&[1; 10])],
            digest: [0; 32],
        };
        assert!(matches!(huge.validate(16 * 1024 * 1024), Err(Error::Transfer(_))));

        let zero = FilePartsRecord {
            block_size: 0,
            ..built.clone()
        };
        assert!(zero.validate(4096).is_err());

        let short = FilePartsRecord {
            blocks: built.blocks()[..2].to_vec(),
            ..built.clone()
        };
        assert!(short.validate(4096).is_err());

        let long = FilePartsRecord {
            file_length: u64::MAX,
            ..built
        };
        assert!(long.validate(4096).is_err());
        assert_eq!(long.block_range(0), Range::new(0, 4096));
    }
}
