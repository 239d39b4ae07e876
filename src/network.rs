//! 전송 코어가 의존하는 외부 협력자 인터페이스
//!
//! - PeerNetwork: 메시지 채널, 연결 상태, 릴레이, 노드 관리 계층
//! - FolderRepository: 공유 폴더의 디스크 경로와 재스캔 요청

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::message::Message;
use crate::nat::UdtConnection;
use crate::peer::{FileInfo, PeerId};
use crate::Result;

/// 노드 간 메시지 채널
///
/// 전달 순서와 신뢰성은 구현체(메시징 계층)가 보장한다.
pub trait PeerNetwork: Send + Sync {
    /// 로컬 노드 ID
    fn myself(&self) -> &PeerId;

    /// 메시지 전송 (송신 큐에 넣을 때까지 대기)
    fn send_message(&self, peer: &PeerId, message: Message) -> Result<()>;

    /// 결과를 기다리지 않는 전송. 실패는 로그만 남긴다.
    fn send_message_async(&self, peer: &PeerId, message: Message) {
        if let Err(e) = self.send_message(peer, message) {
            debug!("비동기 전송 실패 ({}): {}", peer, e);
        }
    }

    /// 상대와 핸드쉐이크까지 끝난 연결이 있는지
    fn is_completely_connected(&self, peer: &PeerId) -> bool;

    /// 현재 사용할 수 있는 릴레이 노드
    fn relay(&self) -> Option<PeerId>;

    /// 상대에게 접속할 주소 (IP 만 사용, 포트는 핸드쉐이크에서 결정)
    fn connect_address(&self, peer: &PeerId) -> Option<SocketAddr>;

    /// 상대가 아직 이 파일의 다운로드를 대기열에 두고 있는지
    fn still_queued_at(&self, peer: &PeerId, _file: &FileInfo) -> bool {
        self.is_completely_connected(peer)
    }

    /// NAT 통과로 만든 수신 연결을 노드 관리 계층에 넘김
    fn accept_connection(&self, connection: UdtConnection);
}

/// 공유 폴더 저장소
pub trait FolderRepository: Send + Sync {
    /// 파일의 디스크 경로 (폴더를 모르면 None)
    fn disk_file(&self, file: &FileInfo) -> Option<PathBuf>;

    /// 다운로드 중 임시 파일 경로
    fn temp_file(&self, file: &FileInfo) -> Option<PathBuf> {
        let target = self.disk_file(file)?;
        let name = target.file_name()?.to_string_lossy().into_owned();
        Some(target.with_file_name(format!(".{name}.swarm-part")))
    }

    /// 디스크 파일이 알려진 정보와 달라졌을 때 재스캔 요청
    fn scan_changed_file(&self, file: &FileInfo);
}

/// 디렉터리 하나를 폴더로 쓰는 저장소
pub struct LocalFolder {
    folder_id: String,
    root: PathBuf,
}

impl LocalFolder {
    pub fn new(folder_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            folder_id: folder_id.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 폴더 안 파일의 현재 FileInfo
    pub fn file_info(&self, name: &str, version: u32) -> std::io::Result<FileInfo> {
        FileInfo::from_disk(&self.folder_id, name, &self.resolve(name), version)
    }

    fn resolve(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

impl FolderRepository for LocalFolder {
    fn disk_file(&self, file: &FileInfo) -> Option<PathBuf> {
        (file.folder_id == self.folder_id).then(|| self.resolve(&file.name))
    }

    fn scan_changed_file(&self, file: &FileInfo) {
        // 스캔은 폴더 계층 담당. 여기서는 요청만 기록한다.
        warn!("파일 재스캔 필요: {}/{}", self.folder_id, file.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_folder_paths() {
        let folder = LocalFolder::new("docs", "/data/docs");
        let file = FileInfo::new("docs", "sub/../../etc/passwd", 1, 0, 1);
        let path = folder.disk_file(&file).unwrap();
        assert!(path.starts_with("/data/docs"));

        let file = FileInfo::new("docs", "a/b.txt", 1, 0, 1);
        assert_eq!(
            folder.temp_file(&file).unwrap(),
            PathBuf::from("/data/docs/a/.b.txt.swarm-part")
        );

        let other = FileInfo::new("music", "a/b.txt", 1, 0, 1);
        assert!(folder.disk_file(&other).is_none());
    }
}
