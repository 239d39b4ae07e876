//! 노드/파일 식별자

use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 파일 수정 시각 비교 허용 오차 (FAT 계열 2초 정밀도 대응)
pub const MODIFIED_DATE_TOLERANCE_MS: i64 = 2000;

/// 노드 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 무작위 식별자 생성
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 파일 식별 정보 (폴더 + 상대 경로 + 버전)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    /// 공유 폴더 ID
    pub folder_id: String,

    /// 폴더 기준 상대 경로 (`/` 구분)
    pub name: String,

    /// 파일 크기 (바이트)
    pub size: u64,

    /// 마지막 수정 시각 (epoch 밀리초)
    pub modified_ms: i64,

    /// 버전 번호
    pub version: u32,
}

impl FileInfo {
    pub fn new(
        folder_id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        modified_ms: i64,
        version: u32,
    ) -> Self {
        Self {
            folder_id: folder_id.into(),
            name: name.into(),
            size,
            modified_ms,
            version,
        }
    }

    /// 디스크 파일의 현재 메타데이터로 생성
    pub fn from_disk(
        folder_id: impl Into<String>,
        name: impl Into<String>,
        path: &Path,
        version: u32,
    ) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::new(
            folder_id,
            name,
            meta.len(),
            modified_ms(&meta)?,
            version,
        ))
    }

    /// 같은 폴더의 같은 파일인지 (버전 무관)
    pub fn is_same_file(&self, other: &FileInfo) -> bool {
        self.folder_id == other.folder_id && self.name == other.name
    }

    /// 같은 파일이며 버전, 수정 시각, 크기까지 일치하는지
    pub fn is_version_date_and_size_identical(&self, other: &FileInfo) -> bool {
        self.is_same_file(other)
            && self.version == other.version
            && self.size == other.size
            && dates_equal_cross_platform(self.modified_ms, other.modified_ms)
    }

    /// 전송 세션 키로 쓰는 (폴더, 이름) 쌍
    pub fn key(&self) -> FileKey {
        FileKey {
            folder_id: self.folder_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// `folder:name:size:modified_ms:version` 형식 (데모 바이너리 간 파일 지정용)
impl std::fmt::Display for FileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.folder_id, self.name, self.size, self.modified_ms, self.version
        )
    }
}

impl FromStr for FileInfo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // 이름에 ':' 가 들어갈 수 있으므로 뒤에서부터 숫자 필드 분리
        let mut parts = s.rsplitn(4, ':');
        let version = parts.next().ok_or("version 누락")?;
        let modified = parts.next().ok_or("modified 누락")?;
        let size = parts.next().ok_or("size 누락")?;
        let head = parts.next().ok_or("folder:name 누락")?;
        let (folder, name) = head.split_once(':').ok_or("folder 구분자 누락")?;

        Ok(FileInfo::new(
            folder,
            name,
            size.parse().map_err(|e| format!("size: {e}"))?,
            modified.parse().map_err(|e| format!("modified: {e}"))?,
            version.parse().map_err(|e| format!("version: {e}"))?,
        ))
    }
}

/// 세션 식별용 파일 키
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub folder_id: String,
    pub name: String,
}

/// 메타데이터의 수정 시각 (epoch 밀리초)
pub fn modified_ms(meta: &std::fs::Metadata) -> std::io::Result<i64> {
    let modified = meta.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    })
}

/// 플랫폼별 시각 정밀도 차이를 감안한 비교
pub fn dates_equal_cross_platform(a_ms: i64, b_ms: i64) -> bool {
    a_ms.abs_diff(b_ms) <= MODIFIED_DATE_TOLERANCE_MS.unsigned_abs()
}
