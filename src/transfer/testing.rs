//! 전송 세션 테스트용 네트워크/저장소

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{TransferContext, TransferManager};
use crate::message::{FileChunk, Message};
use crate::nat::UdtConnection;
use crate::network::{FolderRepository, LocalFolder, PeerNetwork};
use crate::peer::{FileInfo, PeerId};
use crate::{Config, Error, Result};

pub(crate) const FOLDER: &str = "shared";

/// 보낸 메시지를 기록만 하는 네트워크
pub(crate) struct RecordingNetwork {
    me: PeerId,
    sent: Mutex<Vec<(PeerId, Message)>>,
    queued: AtomicBool,
    connected: AtomicBool,
}

impl RecordingNetwork {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            me: PeerId::new(name),
            sent: Mutex::new(Vec::new()),
            queued: AtomicBool::new(true),
            connected: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<(PeerId, Message)> {
        self.sent.lock().clone()
    }

    pub fn chunks(&self) -> Vec<FileChunk> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, m)| match m {
                Message::FileChunk(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 조건이 참이 될 때까지 최대 5초 대기
    pub async fn wait_until(&self, condition: impl Fn(&[(PeerId, Message)]) -> bool) {
        for _ in 0..500 {
            let sent = self.sent();
            if condition(&sent) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("조건 대기 타임아웃: {:?}", self.sent());
    }
}

impl PeerNetwork for RecordingNetwork {
    fn myself(&self) -> &PeerId {
        &self.me
    }

    fn send_message(&self, peer: &PeerId, message: Message) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected(peer.clone()));
        }
        self.sent.lock().push((peer.clone(), message));
        Ok(())
    }

    fn is_completely_connected(&self, _peer: &PeerId) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn relay(&self) -> Option<PeerId> {
        None
    }

    fn connect_address(&self, _peer: &PeerId) -> Option<SocketAddr> {
        None
    }

    fn still_queued_at(&self, _peer: &PeerId, _file: &FileInfo) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    fn accept_connection(&self, _connection: UdtConnection) {}
}

/// 재스캔 요청을 기록하는 폴더
pub(crate) struct ScanRecorder {
    folder: LocalFolder,
    scans: Mutex<Vec<FileInfo>>,
}

impl ScanRecorder {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            folder: LocalFolder::new(FOLDER, root),
            scans: Mutex::new(Vec::new()),
        })
    }

    pub fn scans(&self) -> Vec<FileInfo> {
        self.scans.lock().clone()
    }
}

impl FolderRepository for ScanRecorder {
    fn disk_file(&self, file: &FileInfo) -> Option<std::path::PathBuf> {
        self.folder.disk_file(file)
    }

    fn scan_changed_file(&self, file: &FileInfo) {
        self.scans.lock().push(file.clone());
    }
}

pub(crate) fn context(
    network: Arc<dyn PeerNetwork>,
    repository: Arc<dyn FolderRepository>,
    config: Config,
) -> Arc<TransferContext> {
    let config = Config {
        hash_workers: 2,
        ..config
    };
    Arc::new(TransferContext::new(config, network, repository).unwrap())
}

/// 파일을 쓰고 현재 디스크 상태의 FileInfo 반환
pub(crate) fn write_file(dir: &Path, name: &str, data: &[u8]) -> FileInfo {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    FileInfo::from_disk(FOLDER, name, &path, 1).unwrap()
}

/// 두 코디네이터를 직접 잇는 네트워크 (한 방향)
pub(crate) struct PairNetwork {
    me: PeerId,
    other: Mutex<Option<Weak<TransferManager>>>,
    sent: Mutex<Vec<Message>>,
    connected: AtomicBool,
}

impl PairNetwork {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            me: PeerId::new(name),
            other: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn link(&self, other: &Arc<TransferManager>) {
        *self.other.lock() = Some(Arc::downgrade(other));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Message) -> bool) -> usize {
        self.sent.lock().iter().filter(|m| matches(m)).count()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl PeerNetwork for PairNetwork {
    fn myself(&self) -> &PeerId {
        &self.me
    }

    fn send_message(&self, peer: &PeerId, message: Message) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected(peer.clone()));
        }
        let other = self
            .other
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        self.sent.lock().push(message.clone());
        other.handle_message(&self.me, message);
        Ok(())
    }

    fn is_completely_connected(&self, _peer: &PeerId) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn relay(&self) -> Option<PeerId> {
        None
    }

    fn connect_address(&self, _peer: &PeerId) -> Option<SocketAddr> {
        None
    }

    fn accept_connection(&self, _connection: UdtConnection) {}
}
