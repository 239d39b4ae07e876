//! 전송 코디네이터
//!
//! - (상대, 파일) 별 업로드/다운로드 세션 관리
//! - 동시 실행 수 제한 (세마포어)
//! - 메시지를 세션으로 라우팅
//! - 세션 종료 이벤트 발행, 주기적 상태 점검

use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::download::Download;
use super::state::{Outcome, TransferState};
use super::upload::Upload;
use super::TransferContext;
use crate::error::TransferProblem;
use crate::message::{AbortDownload, AbortUpload, Message, RequestDownload, RequestPart};
use crate::network::{FolderRepository, PeerNetwork};
use crate::peer::{FileInfo, FileKey, PeerId};
use crate::stats::TransferStats;
use crate::{Config, Result};

type SessionKey = (PeerId, FileKey);

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

/// 세션 종료 알림
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub peer: PeerId,
    pub file: FileInfo,
    pub direction: Direction,
    pub outcome: Outcome,
}

pub struct TransferManager {
    ctx: Arc<TransferContext>,
    uploads: DashMap<SessionKey, Arc<Upload>>,
    downloads: DashMap<SessionKey, Arc<Download>>,
    upload_slots: Arc<Semaphore>,
    download_slots: Arc<Semaphore>,
    events_tx: Sender<TransferEvent>,
    events_rx: Receiver<TransferEvent>,
}

impl TransferManager {
    pub fn new(
        config: Config,
        network: Arc<dyn PeerNetwork>,
        repository: Arc<dyn FolderRepository>,
    ) -> Result<Arc<Self>> {
        let upload_slots = Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1)));
        let download_slots = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        let ctx = Arc::new(TransferContext::new(config, network, repository)?);
        let (events_tx, events_rx) = unbounded();

        Ok(Arc::new(Self {
            ctx,
            uploads: DashMap::new(),
            downloads: DashMap::new(),
            upload_slots,
            download_slots,
            events_tx,
            events_rx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn myself(&self) -> &PeerId {
        self.ctx.network.myself()
    }

    /// 세션 종료 이벤트 수신 채널
    pub fn events(&self) -> Receiver<TransferEvent> {
        self.events_rx.clone()
    }

    pub fn stats(&self) -> TransferStats {
        self.ctx.stats.lock().clone()
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }

    pub fn upload(&self, peer: &PeerId, file: &FileInfo) -> Option<Arc<Upload>> {
        self.uploads
            .get(&(peer.clone(), file.key()))
            .map(|s| s.value().clone())
    }

    pub fn download(&self, peer: &PeerId, file: &FileInfo) -> Option<Arc<Download>> {
        self.downloads
            .get(&(peer.clone(), file.key()))
            .map(|s| s.value().clone())
    }

    /// 상대의 다운로드 요청으로 업로드 세션 시작
    ///
    /// 같은 파일의 이전 세션이 있으면 중단하고 새로 시작한다.
    pub fn start_upload(self: &Arc<Self>, peer: &PeerId, request: RequestDownload) -> Arc<Upload> {
        let key = (peer.clone(), request.file.key());
        let upload = Arc::new(Upload::new(
            self.ctx.clone(),
            peer.clone(),
            request.file.clone(),
        ));

        if let Some(previous) = self.uploads.insert(key.clone(), upload.clone()) {
            debug!("이전 업로드 세션 교체: {} -> {}", previous.file().name, peer);
            previous.abort();
        }
        if request.start_offset > 0 {
            debug!(
                "{} 가 offset {} 부터 요청: {}",
                peer, request.start_offset, request.file.name
            );
        }

        let manager = self.clone();
        let session = upload.clone();
        tokio::spawn(async move {
            session.status().set_state(TransferState::Waiting);
            let outcome = match manager.upload_slots.clone().acquire_owned().await {
                Ok(_permit) => session.run().await,
                Err(_) => Outcome::Broken(
                    TransferProblem::GeneralException,
                    "업로드 워커 풀 종료".to_string(),
                ),
            };
            manager.finish_upload(key, &session, outcome);
        });
        upload
    }

    /// 다운로드 세션 시작. 이미 진행 중이면 기존 세션 반환.
    pub fn start_download(self: &Arc<Self>, peer: &PeerId, file: FileInfo) -> Arc<Download> {
        let key = (peer.clone(), file.key());
        let download = match self.downloads.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return existing.get().clone();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let download = Arc::new(Download::new(self.ctx.clone(), peer.clone(), file));
                entry.insert(download.clone());
                download
            }
        };

        let manager = self.clone();
        let session = download.clone();
        tokio::spawn(async move {
            session.status().set_state(TransferState::Waiting);
            let outcome = match manager.download_slots.clone().acquire_owned().await {
                Ok(_permit) => session.run().await,
                Err(_) => Outcome::Broken(
                    TransferProblem::GeneralException,
                    "다운로드 워커 풀 종료".to_string(),
                ),
            };
            manager.finish_download(key, &session, outcome);
        });
        download
    }

    /// 받은 메시지를 해당 세션으로 전달
    pub fn handle_message(self: &Arc<Self>, from: &PeerId, message: Message) {
        match message {
            Message::RequestDownload(request) => {
                self.start_upload(from, request);
            }
            Message::StartUpload(start) => match self.download(from, &start.file) {
                Some(download) => download.upload_started(),
                None => self.no_session(from, &start.file, "StartUpload"),
            },
            Message::StopUpload(stop) => {
                if let Some(upload) = self.upload(from, &stop.file) {
                    upload.stop_upload_request();
                }
            }
            Message::AbortUpload(abort) => {
                if let Some(download) = self.download(from, &abort.file) {
                    download.remote_aborted();
                }
            }
            Message::AbortDownload(abort) => {
                if let Some(upload) = self.upload(from, &abort.file) {
                    upload.abort();
                }
            }
            Message::RequestPart(request) => match self.upload(from, &request.file) {
                Some(upload) => {
                    upload.enqueue_part_request(request);
                }
                None => self.no_session(from, &request.file, "RequestPart"),
            },
            Message::FileChunk(chunk) => match self.download(from, &chunk.file) {
                Some(download) => download.received_chunk(chunk),
                None => self.no_session(from, &chunk.file, "FileChunk"),
            },
            Message::RequestFilePartsRecord(request) => {
                match self.upload(from, &request.file) {
                    Some(upload) => {
                        upload.received_parts_record_request();
                    }
                    None => self.no_session(from, &request.file, "RequestFilePartsRecord"),
                }
            }
            Message::ReplyFilePartsRecord(reply) => match self.download(from, &reply.file) {
                Some(download) => download.received_record(reply.record),
                None => self.no_session(from, &reply.file, "ReplyFilePartsRecord"),
            },
            Message::Identify(_) | Message::Udt(_) => {
                debug!("전송 계층 대상이 아닌 메시지 무시: {:?}", message.msg_type());
            }
        }
    }

    fn no_session(&self, from: &PeerId, file: &FileInfo, what: &str) {
        debug!("{} 의 {} 에 해당하는 세션 없음: {}", from, what, file.name);
    }

    /// 업로드 중단 (상대에게도 알림)
    pub fn abort_upload(&self, peer: &PeerId, file: &FileInfo) -> bool {
        let Some(upload) = self.upload(peer, file) else {
            return false;
        };
        upload.abort();
        self.ctx.network.send_message_async(
            peer,
            Message::AbortUpload(AbortUpload {
                file: upload.file().clone(),
            }),
        );
        true
    }

    /// 다운로드 중단 (상대에게도 알림)
    pub fn abort_download(&self, peer: &PeerId, file: &FileInfo) -> bool {
        let Some(download) = self.download(peer, file) else {
            return false;
        };
        download.abort();
        self.ctx.network.send_message_async(
            peer,
            Message::AbortDownload(AbortDownload {
                file: download.file().clone(),
            }),
        );
        true
    }

    /// 아직 처리하지 않은 RequestPart 취소
    pub fn cancel_part_request(&self, peer: &PeerId, request: &RequestPart) -> bool {
        self.upload(peer, &request.file)
            .map(|upload| upload.cancel_part_request(request))
            .unwrap_or(false)
    }

    /// 상대와 연결이 끊김: 관련 세션 모두 깨뜨림
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let message = format!("{} 와 연결 끊김", peer);
        for entry in self.uploads.iter().filter(|e| e.key().0 == *peer) {
            entry.value().break_with(TransferProblem::Disconnected, message.clone());
        }
        for entry in self.downloads.iter().filter(|e| e.key().0 == *peer) {
            entry.value().break_with(TransferProblem::Disconnected, message.clone());
        }
    }

    /// 모든 세션 상태 점검. 깨진 세션 수 반환.
    pub fn check_health(&self) -> usize {
        // 점검 중 세션이 맵에서 빠질 수 있으므로 먼저 복사
        let uploads: Vec<Arc<Upload>> = self.uploads.iter().map(|e| e.value().clone()).collect();
        let downloads: Vec<Arc<Download>> =
            self.downloads.iter().map(|e| e.value().clone()).collect();

        let broken_uploads = uploads
            .iter()
            .filter(|u| u.health().state == TransferState::Broken)
            .count();
        let broken_downloads = downloads
            .iter()
            .filter(|d| d.health().state == TransferState::Broken)
            .count();
        broken_uploads + broken_downloads
    }

    /// 주기적 상태 점검 태스크. 코디네이터가 drop 되면 끝난다.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.ctx.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let broken = manager.check_health();
                if broken > 0 {
                    debug!("상태 점검: 깨진 세션 {}개", broken);
                }
            }
        })
    }

    fn finish_upload(&self, key: SessionKey, session: &Arc<Upload>, outcome: Outcome) {
        // 교체된 세션이면 맵의 새 세션은 건드리지 않는다
        let removed = self
            .uploads
            .remove_if(&key, |_, current| Arc::ptr_eq(current, session));
        if removed.is_none() {
            return;
        }
        if matches!(outcome, Outcome::Broken(..)) {
            // 상대 다운로드가 타임아웃까지 기다리지 않도록
            self.ctx.network.send_message_async(
                &key.0,
                Message::AbortUpload(AbortUpload {
                    file: session.file().clone(),
                }),
            );
        }
        self.record_outcome(Direction::Upload, &outcome);
        self.publish(TransferEvent {
            peer: key.0,
            file: session.file().clone(),
            direction: Direction::Upload,
            outcome,
        });
    }

    fn finish_download(&self, key: SessionKey, session: &Arc<Download>, outcome: Outcome) {
        let removed = self
            .downloads
            .remove_if(&key, |_, current| Arc::ptr_eq(current, session));
        if removed.is_none() {
            return;
        }
        if matches!(outcome, Outcome::Broken(..)) {
            self.ctx.network.send_message_async(
                &key.0,
                Message::AbortDownload(AbortDownload {
                    file: session.file().clone(),
                }),
            );
        }
        self.record_outcome(Direction::Download, &outcome);
        self.publish(TransferEvent {
            peer: key.0,
            file: session.file().clone(),
            direction: Direction::Download,
            outcome,
        });
    }

    fn record_outcome(&self, direction: Direction, outcome: &Outcome) {
        let mut stats = self.ctx.stats.lock();
        match (direction, outcome) {
            (Direction::Upload, Outcome::Completed) => stats.completed_uploads += 1,
            (Direction::Download, Outcome::Completed) => stats.completed_downloads += 1,
            (_, Outcome::Broken(..)) => stats.broken_transfers += 1,
            (_, Outcome::Aborted) => stats.aborted_transfers += 1,
        }
    }

    fn publish(&self, event: TransferEvent) {
        match &event.outcome {
            Outcome::Completed => info!(
                "{:?} 완료: {} ({})",
                event.direction, event.file.name, event.peer
            ),
            Outcome::Broken(problem, message) => warn!(
                "{:?} 실패: {} ({}): {} {}",
                event.direction, event.file.name, event.peer, problem, message
            ),
            Outcome::Aborted => info!(
                "{:?} 중단: {} ({})",
                event.direction, event.file.name, event.peer
            ),
        }
        // 수신자가 없어도 코디네이터는 계속 동작한다
        let _ = self.events_tx.send(event);
    }
}
