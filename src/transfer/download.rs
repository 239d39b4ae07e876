//! 다운로드 세션 (클라이언트 측)
//!
//! RequestDownload → StartUpload 대기 → (basis 가 있으면) parts record 교환과 로컬 매칭
//! → 빠진 구간만 RequestPart → FileChunk 기록 → 검증 후 임시 파일을 대상 위치로 이동.
//!
//! 네트워크 이벤트는 채널로 받아 세션 태스크 하나에서 순서대로 처리한다.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::parts::{ChunkOutcome, PartsTracker};
use super::state::{Outcome, StatusHandle, TransferState, TransferStatus};
use super::TransferContext;
use crate::delta::{FileMatcher, FilePartsRecord};
use crate::error::TransferProblem;
use crate::message::{
    FileChunk, Message, RequestDownload, RequestFilePartsRecord, RequestPart, StopUpload,
};
use crate::peer::{FileInfo, PeerId};
use crate::range::Range;
use crate::stats::TransferCounter;
use crate::{Error, Result};

/// 세션 태스크로 전달되는 이벤트
#[derive(Debug)]
enum DownloadEvent {
    Started,
    Record(FilePartsRecord),
    Chunk(FileChunk),
    RemoteAborted,
    /// 로컬 중단 또는 외부에서 깨짐 표시
    Stop,
}

/// 로컬에서 재사용할 파일
struct Basis {
    path: PathBuf,
    /// 매칭 후 지울 임시 사본인지
    temporary: bool,
}

impl Drop for Basis {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct Download {
    ctx: Arc<TransferContext>,
    peer: PeerId,
    file: FileInfo,
    status: StatusHandle,
    aborted: AtomicBool,
    events: mpsc::UnboundedSender<DownloadEvent>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<DownloadEvent>>>,
    counter: Mutex<TransferCounter>,
}

impl Download {
    pub fn new(ctx: Arc<TransferContext>, peer: PeerId, file: FileInfo) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        let counter = TransferCounter::new(ctx.config.stats_window_size);
        Self {
            ctx,
            peer,
            file,
            status: StatusHandle::new(),
            aborted: AtomicBool::new(false),
            events,
            inbox: Mutex::new(Some(inbox)),
            counter: Mutex::new(counter),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counter.lock().total_bytes
    }

    pub fn upload_started(&self) {
        let _ = self.events.send(DownloadEvent::Started);
    }

    pub fn received_record(&self, record: FilePartsRecord) {
        let _ = self.events.send(DownloadEvent::Record(record));
    }

    pub fn received_chunk(&self, chunk: FileChunk) {
        let _ = self.events.send(DownloadEvent::Chunk(chunk));
    }

    /// 상대가 업로드를 중단함
    pub fn remote_aborted(&self) {
        let _ = self.events.send(DownloadEvent::RemoteAborted);
    }

    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.set_state(TransferState::Aborted);
        let _ = self.events.send(DownloadEvent::Stop);
        debug!("다운로드 중단: {} <- {}", self.file.name, self.peer);
    }

    pub fn break_with(&self, problem: TransferProblem, message: impl Into<String>) {
        let message = message.into();
        if self.status.mark_broken(problem, message.clone()) {
            warn!(
                "다운로드 실패 {} <- {}: {} ({})",
                self.file.name, self.peer, problem, message
            );
        }
        let _ = self.events.send(DownloadEvent::Stop);
    }

    /// 상태 점검 후 현재 상태 반환 (상대와 연결이 끊겼으면 깨진 것으로 본다)
    pub fn health(&self) -> TransferStatus {
        if !self.status.state().is_finished()
            && !self.ctx.network.is_completely_connected(&self.peer)
        {
            self.break_with(
                TransferProblem::Disconnected,
                format!("{} 와 연결 끊김", self.peer),
            );
        }
        self.status.snapshot()
    }

    /// 세션 실행. 어떤 에러도 세션 밖으로 내보내지 않는다.
    pub async fn run(&self) -> Outcome {
        let Some(mut inbox) = self.inbox.lock().take() else {
            return Outcome::Broken(
                TransferProblem::GeneralException,
                "이미 실행된 세션".to_string(),
            );
        };

        if let Err(e) = self.download(&mut inbox).await {
            if !self.is_aborted() {
                self.break_with(e.problem(), e.to_string());
            }
        }

        if self.is_aborted() {
            return Outcome::Aborted;
        }
        if let Some((problem, message)) = self.status.problem() {
            return Outcome::Broken(problem, message);
        }
        Outcome::Completed
    }

    async fn download(&self, inbox: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Result<()> {
        if self.status.state().is_finished() {
            return Ok(());
        }
        let config = &self.ctx.config;
        let target = self
            .ctx
            .repository
            .disk_file(&self.file)
            .ok_or_else(|| Error::FileNotFound(PathBuf::from(&self.file.name)))?;
        let temp = self
            .ctx
            .repository
            .temp_file(&self.file)
            .ok_or_else(|| Error::FileNotFound(PathBuf::from(&self.file.name)))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.status.set_state(TransferState::Waiting);
        self.ctx.network.send_message(
            &self.peer,
            Message::RequestDownload(RequestDownload {
                file: self.file.clone(),
                start_offset: 0,
            }),
        )?;

        loop {
            match self.next_event(inbox).await? {
                None => return Ok(()),
                Some(DownloadEvent::Started) => break,
                Some(other) => debug!("StartUpload 전 이벤트 무시: {:?}", other),
            }
        }

        let basis = prepare_basis(&target, &temp).await?;
        let output = tokio::fs::File::create(&temp).await?;
        output.set_len(self.file.size).await?;
        drop(output);

        let mut tracker = PartsTracker::new(self.file.size);
        let mut expected_digest = None;

        match &basis {
            Some(basis) if self.file.size >= config.min_size_for_part_transfers => {
                self.ctx.network.send_message(
                    &self.peer,
                    Message::RequestFilePartsRecord(RequestFilePartsRecord {
                        file: self.file.clone(),
                    }),
                )?;
                self.status.set_state(TransferState::RemoteMatching);

                let record = loop {
                    match self.next_event(inbox).await? {
                        None => return Ok(()),
                        Some(DownloadEvent::Record(record)) => break record,
                        Some(other) => debug!("parts record 대기 중 이벤트 무시: {:?}", other),
                    }
                };
                if record.file_length() != self.file.size {
                    return Err(Error::Transfer(format!(
                        "record 크기 불일치: {} != {}",
                        record.file_length(),
                        self.file.size
                    )));
                }
                record.validate(config.record_max_block_size)?;
                expected_digest = Some(*record.digest());

                self.status.set_state(TransferState::Matching);
                let (matched, missing) = self.match_basis(record, &basis.path, &temp).await?;
                for range in matched {
                    tracker.mark_filled(range);
                }
                tracker.restrict_to(missing);
                self.ctx.stats.lock().reused_bytes += tracker.received_bytes();
                debug!(
                    "{}: 로컬에서 {} / {} bytes 재사용",
                    self.file.name,
                    tracker.received_bytes(),
                    self.file.size
                );
            }
            // 작은 파일은 매칭 없이 전체를 받는다
            Some(_) | None => {}
        }
        // 임시 basis 사본은 drop 시 삭제
        drop(basis);

        self.status.set_state(TransferState::Downloading);
        let mut output = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&temp)
            .await?;
        self.request_more(&mut tracker)?;

        while !tracker.is_complete() {
            let chunk = match self.next_event(inbox).await? {
                None => return Ok(()),
                Some(DownloadEvent::Chunk(chunk)) => chunk,
                Some(other) => {
                    debug!("다운로드 중 이벤트 무시: {:?}", other);
                    continue;
                }
            };

            self.validate_chunk(&chunk)?;
            let range = chunk.range();
            match tracker.on_chunk(range) {
                ChunkOutcome::Duplicate => {
                    debug!("중복 청크 버림: {}", range);
                }
                ChunkOutcome::New => {
                    output.seek(SeekFrom::Start(range.start)).await?;
                    output.write_all(&chunk.data).await?;
                    self.counter.lock().chunk_transferred(chunk.data.len());
                    self.ctx
                        .stats
                        .lock()
                        .download
                        .chunk_transferred(chunk.data.len());
                    self.status.set_progress(tracker.progress());
                }
            }
            self.request_more(&mut tracker)?;
        }

        output.flush().await?;
        output.sync_all().await?;
        drop(output);

        self.finish(&temp, &target, expected_digest).await?;
        self.status.set_state(TransferState::Completed);

        // 업로드 측 세션 정리 (실패해도 상대는 타임아웃으로 끝난다)
        self.ctx.network.send_message_async(
            &self.peer,
            Message::StopUpload(StopUpload {
                file: self.file.clone(),
            }),
        );

        let counter = self.counter.lock();
        info!(
            "다운로드 완료: {} <- {} ({} bytes 수신, {:.2} MB/s)",
            self.file.name,
            self.peer,
            counter.total_bytes,
            counter.average_rate() / 1_000_000.0
        );
        Ok(())
    }

    /// 다음 이벤트. 중단/깨짐이면 None, 타임아웃이면 에러.
    async fn next_event(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<DownloadEvent>,
    ) -> Result<Option<DownloadEvent>> {
        let timeout = self.ctx.config.download_timeout();
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Err(_) => Err(Error::Transfer(format!(
                "{}ms 동안 {} 응답 없음",
                timeout.as_millis(),
                self.peer
            ))),
            Ok(None) | Ok(Some(DownloadEvent::Stop)) => Ok(None),
            Ok(Some(DownloadEvent::RemoteAborted)) => Err(Error::Transfer(format!(
                "{} 가 업로드를 중단함",
                self.peer
            ))),
            Ok(Some(event)) => {
                if self.status.state().is_finished() {
                    return Ok(None);
                }
                Ok(Some(event))
            }
        }
    }

    /// 요청 중인 구간이 상한에 찰 때까지 RequestPart 전송
    fn request_more(&self, tracker: &mut PartsTracker) -> Result<()> {
        let config = &self.ctx.config;
        while tracker.outstanding() < config.max_requests_queued.max(1) {
            let Some(range) = tracker.next_request(config.max_file_chunk_size) else {
                break;
            };
            self.ctx.network.send_message(
                &self.peer,
                Message::RequestPart(RequestPart::new(
                    self.file.clone(),
                    range,
                    tracker.progress(),
                )),
            )?;
        }
        Ok(())
    }

    fn validate_chunk(&self, chunk: &FileChunk) -> Result<()> {
        if !chunk.file.is_version_date_and_size_identical(&self.file) {
            return Err(Error::Transfer(format!(
                "다른 파일의 청크: {} (기대 {})",
                chunk.file, self.file
            )));
        }
        if !chunk.verify_crc() {
            return Err(Error::Transfer(format!(
                "청크 CRC 불일치: offset {}",
                chunk.offset
            )));
        }
        if chunk.range().checked_end().map_or(true, |end| end > self.file.size) {
            return Err(Error::Transfer(format!(
                "파일 크기를 넘는 청크: {}",
                chunk.range()
            )));
        }
        Ok(())
    }

    /// basis 에서 record 의 블록을 찾아 임시 파일에 복사
    ///
    /// (채운 구간, 받아야 할 구간) 반환
    async fn match_basis(
        &self,
        record: FilePartsRecord,
        basis: &Path,
        temp: &Path,
    ) -> Result<(Vec<Range>, Vec<Range>)> {
        let basis = basis.to_path_buf();
        let temp = temp.to_path_buf();
        let status = self.status.clone();

        tokio::task::spawn_blocking(move || -> Result<(Vec<Range>, Vec<Range>)> {
            let mut source = std::fs::File::open(&basis)?;
            let length = source.metadata()?.len();
            let matcher = FileMatcher::new(&record);
            let progress = move |p: f64| status.set_progress(p);
            let matches = matcher.find_matches(
                std::io::BufReader::new(&mut source),
                length,
                &progress,
            )?;

            let mut output = std::fs::OpenOptions::new().write(true).open(&temp)?;
            let mut block = vec![0u8; record.block_size() as usize];
            let mut matched = Vec::with_capacity(matches.len());
            for m in &matches {
                let range = record.block_range(m.block_index);
                let buf = &mut block[..range.length as usize];
                source.seek(SeekFrom::Start(m.basis_offset))?;
                source.read_exact(buf)?;
                output.seek(SeekFrom::Start(range.start))?;
                output.write_all(buf)?;
                matched.push(range);
            }
            output.flush()?;

            let missing = matcher.missing_ranges(&matches);
            Ok((matched, missing))
        })
        .await
        .map_err(|e| Error::Transfer(format!("매칭 태스크 실패: {e}")))?
    }

    /// 크기/digest 검증, 수정 시각 설정, 대상 위치로 이동
    async fn finish(&self, temp: &Path, target: &Path, digest: Option<[u8; 32]>) -> Result<()> {
        let temp = temp.to_path_buf();
        let target = target.to_path_buf();
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let handle = std::fs::File::options().read(true).write(true).open(&temp)?;
            let actual = handle.metadata()?.len();
            if actual != file.size {
                return Err(Error::Transfer(format!(
                    "다운로드 크기 불일치: {} != {}",
                    actual, file.size
                )));
            }

            if let Some(expected) = digest {
                let mut hasher = blake3::Hasher::new();
                std::io::copy(&mut std::io::BufReader::new(&handle), &mut hasher)?;
                if hasher.finalize().as_bytes() != &expected {
                    // 손상된 파일은 다음 시도의 basis 로 쓰지 않는다
                    drop(handle);
                    let _ = std::fs::remove_file(&temp);
                    return Err(Error::Transfer(format!(
                        "다운로드 digest 불일치: {}",
                        file.name
                    )));
                }
            }

            if file.modified_ms >= 0 {
                let modified = UNIX_EPOCH + Duration::from_millis(file.modified_ms as u64);
                handle.set_modified(modified)?;
            }
            drop(handle);

            std::fs::rename(&temp, &target)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Transfer(format!("완료 처리 태스크 실패: {e}")))?
    }
}

/// 재사용할 로컬 파일 선택
///
/// 이전 시도의 임시 파일이 있으면 그것을, 없으면 현재 디스크의 이전 버전을 쓴다.
async fn prepare_basis(target: &Path, temp: &Path) -> Result<Option<Basis>> {
    if tokio::fs::metadata(temp).await.map(|m| m.is_file()).unwrap_or(false) {
        let mut name = temp.as_os_str().to_owned();
        name.push(".basis");
        let path = PathBuf::from(name);
        tokio::fs::rename(temp, &path).await?;
        return Ok(Some(Basis {
            path,
            temporary: true,
        }));
    }

    if tokio::fs::metadata(target).await.map(|m| m.is_file()).unwrap_or(false) {
        return Ok(Some(Basis {
            path: target.to_path_buf(),
            temporary: false,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::BlockChecksum;
    use crate::network::FolderRepository;
    use crate::transfer::testing::{context, RecordingNetwork, ScanRecorder, FOLDER};
    use crate::Config;
    use bytes::Bytes;

    fn sent_count(network: &RecordingNetwork, matches: impl Fn(&Message) -> bool) -> usize {
        network.sent().iter().filter(|(_, m)| matches(m)).count()
    }

    /// 상대가 보낸 것처럼 bincode 로 만든 record
    fn wire_record(file_length: u64, block_size: u32, blocks: usize) -> FilePartsRecord {
        let checksums = vec![BlockChecksum::of(&[1u8; 16]); blocks];
        let bytes = bincode::serialize(&(file_length, block_size, checksums, [0u8; 32])).unwrap();
        bincode::deserialize(&bytes).unwrap()
    }

    /// 세션을 띄우고 StartUpload 까지 진행
    async fn started(
        network: &Arc<RecordingNetwork>,
        dir: &Path,
        file: &FileInfo,
    ) -> (Arc<Download>, tokio::task::JoinHandle<Outcome>) {
        let ctx = context(network.clone(), ScanRecorder::new(dir), Config::default());
        let download = Arc::new(Download::new(ctx, PeerId::new("server"), file.clone()));
        let session = download.clone();
        let task = tokio::spawn(async move { session.run().await });

        network
            .wait_until(|sent| sent.iter().any(|(_, m)| matches!(m, Message::RequestDownload(_))))
            .await;
        download.upload_started();
        (download, task)
    }

    #[tokio::test]
    async fn test_oversized_record_block_breaks_download() {
        let dir = tempfile::tempdir().unwrap();
        let old = vec![3u8; 20_000];
        std::fs::write(dir.path().join("a.bin"), &old).unwrap();
        let file = FileInfo::new(FOLDER, "a.bin", 20_000, 1_700_000_000_000, 2);
        let network = RecordingNetwork::new("client");

        let (download, task) = started(&network, dir.path(), &file).await;
        network
            .wait_until(|sent| {
                sent.iter()
                    .any(|(_, m)| matches!(m, Message::RequestFilePartsRecord(_)))
            })
            .await;
        download.received_record(wire_record(20_000, u32::MAX, 1));

        assert!(matches!(
            task.await.unwrap(),
            Outcome::Broken(TransferProblem::TransferException, _)
        ));
        assert_eq!(sent_count(&network, |m| matches!(m, Message::RequestPart(_))), 0);
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), old);
    }

    #[tokio::test]
    async fn test_inconsistent_record_removes_temporary_basis() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileInfo::new(FOLDER, "a.bin", 20_000, 1_700_000_000_000, 2);
        let network = RecordingNetwork::new("client");

        // 이전 시도의 임시 파일
        let repository = ScanRecorder::new(dir.path());
        let temp = repository.temp_file(&file).unwrap();
        std::fs::write(&temp, vec![5u8; 12_000]).unwrap();
        let mut basis_name = temp.as_os_str().to_owned();
        basis_name.push(".basis");
        let basis = PathBuf::from(basis_name);

        let (download, task) = started(&network, dir.path(), &file).await;
        network
            .wait_until(|sent| {
                sent.iter()
                    .any(|(_, m)| matches!(m, Message::RequestFilePartsRecord(_)))
            })
            .await;
        // 20_000 bytes 를 4KB 블록으로 나누면 5 개여야 한다
        download.received_record(wire_record(20_000, 4096, 1));

        assert!(matches!(
            task.await.unwrap(),
            Outcome::Broken(TransferProblem::TransferException, _)
        ));
        assert!(!basis.exists());
    }

    #[tokio::test]
    async fn test_malformed_chunks_break_download() {
        let network = RecordingNetwork::new("client");
        let file = FileInfo::new(FOLDER, "a.bin", 1_000, 1_700_000_000_000, 2);

        // u64 를 넘는 offset
        let dir = tempfile::tempdir().unwrap();
        let (download, task) = started(&network, dir.path(), &file).await;
        network
            .wait_until(|sent| sent.iter().any(|(_, m)| matches!(m, Message::RequestPart(_))))
            .await;
        download.received_chunk(FileChunk::new(
            file.clone(),
            u64::MAX - 5,
            Bytes::from(vec![1u8; 10]),
        ));
        assert!(matches!(
            task.await.unwrap(),
            Outcome::Broken(TransferProblem::TransferException, _)
        ));
        assert_eq!(download.bytes_received(), 0);

        // 극단적인 수정 시각
        let dir = tempfile::tempdir().unwrap();
        let (download, task) = started(&network, dir.path(), &file).await;
        let mut other = file.clone();
        other.modified_ms = i64::MIN;
        download.received_chunk(FileChunk::new(other, 0, Bytes::from(vec![1u8; 10])));
        assert!(matches!(
            task.await.unwrap(),
            Outcome::Broken(TransferProblem::TransferException, _)
        ));
        assert!(!dir.path().join("a.bin").exists());
    }
}
