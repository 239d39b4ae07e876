//! 업로드 세션 (서버 측)
//!
//! 상태 흐름: Initializing → Waiting → [FileHashing → RemoteMatching] → Uploading → 종료
//!
//! - 요청은 대기 큐에서 FIFO 로 처리
//! - 큐 상한 초과, 잘못된 요청, 파일 변경은 세션을 깨뜨린다
//! - abort 는 큐를 닫아 대기 중인 루프를 즉시 깨운다

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::queue::{PendingRequests, PushError, UploadRequest};
use super::state::{Outcome, StatusHandle, TransferState, TransferStatus};
use super::TransferContext;
use crate::error::TransferProblem;
use crate::message::{FileChunk, Message, ReplyFilePartsRecord, RequestPart, StartUpload};
use crate::peer::{self, FileInfo, PeerId};
use crate::stats::TransferCounter;
use crate::{Error, Result};

pub struct Upload {
    ctx: Arc<TransferContext>,
    peer: PeerId,
    file: FileInfo,
    queue: PendingRequests,
    status: StatusHandle,
    aborted: AtomicBool,
    /// 청크 전송과 abort 를 직렬화 (abort 이후에는 청크가 나가지 않는다)
    send_gate: Mutex<()>,
    counter: Mutex<TransferCounter>,
}

impl Upload {
    pub fn new(ctx: Arc<TransferContext>, peer: PeerId, file: FileInfo) -> Self {
        let queue = PendingRequests::new(ctx.config.max_pending_requests());
        let counter = TransferCounter::new(ctx.config.stats_window_size);
        Self {
            ctx,
            peer,
            file,
            queue,
            status: StatusHandle::new(),
            aborted: AtomicBool::new(false),
            send_gate: Mutex::new(()),
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

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counter.lock().total_bytes
    }

    /// 상대의 RequestPart 를 대기 큐에 넣는다. 받아들였으면 true.
    pub fn enqueue_part_request(&self, request: RequestPart) -> bool {
        if self.is_aborted() || self.status.state().is_finished() {
            return false;
        }

        if !request.file.is_version_date_and_size_identical(&self.file) {
            self.break_with(
                TransferProblem::InvalidPart,
                format!("다른 파일에 대한 요청: {} (현재 {})", request.file, self.file),
            );
            return false;
        }
        if request.range.is_empty() {
            self.break_with(
                TransferProblem::InvalidPart,
                format!("빈 구간 요청: {}", request.range),
            );
            return false;
        }
        if request
            .range
            .checked_end()
            .map_or(true, |end| end > self.file.size)
        {
            self.break_with(
                TransferProblem::InvalidPart,
                format!("요청 구간이 파일 크기 초과: {} > {}", request.range, self.file.size),
            );
            return false;
        }
        if request.range.length > self.ctx.config.max_file_chunk_size {
            warn!(
                "{} 의 요청 구간이 최대 청크보다 큼: {} bytes",
                self.peer, request.range.length
            );
        }

        self.push(UploadRequest::Part(request))
    }

    /// parts record 요청 (delta 전송 시작)
    pub fn received_parts_record_request(&self) -> bool {
        if self.is_aborted() || self.status.state().is_finished() {
            return false;
        }
        if self.file.size < self.ctx.config.min_size_for_part_transfers {
            self.break_with(
                TransferProblem::GeneralException,
                format!(
                    "부분 전송 대상이 아닌 작은 파일: {} bytes",
                    self.file.size
                ),
            );
            return false;
        }
        self.push(UploadRequest::PartsRecord)
    }

    /// 상대가 더 받을 것이 없음
    pub fn stop_upload_request(&self) {
        self.queue.stop();
    }

    /// 아직 처리하지 않은 요청 취소
    pub fn cancel_part_request(&self, request: &RequestPart) -> bool {
        self.queue.cancel(request)
    }

    /// 중단. 여러 번 불러도 결과는 같다.
    pub fn abort(&self) {
        {
            let _gate = self.send_gate.lock();
            if self.aborted.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.queue.close();
        self.status.set_state(TransferState::Aborted);
        debug!("업로드 중단: {} -> {}", self.file.name, self.peer);
    }

    /// 세션을 깨뜨린다 (처음 사유만 기록)
    pub fn break_with(&self, problem: TransferProblem, message: impl Into<String>) {
        let message = message.into();
        if self.status.mark_broken(problem, message.clone()) {
            warn!(
                "업로드 실패 {} -> {}: {} ({})",
                self.file.name, self.peer, problem, message
            );
        }
        self.queue.close();
    }

    /// 상태 점검 후 현재 상태 반환
    ///
    /// 상대가 더 이상 이 전송을 기다리지 않거나 원본 파일이 사라졌으면 깨진 것으로 본다.
    pub fn health(&self) -> TransferStatus {
        if !self.status.state().is_finished() {
            if !self.ctx.network.still_queued_at(&self.peer, &self.file) {
                self.break_with(
                    TransferProblem::NotQueuedAtPartner,
                    format!("{} 가 더 이상 대기열에 두지 않음", self.peer),
                );
            } else if !self.source_exists() {
                self.break_with(
                    TransferProblem::FileNotFound,
                    format!("원본 파일 없음: {}", self.file.name),
                );
            }
        }
        self.status.snapshot()
    }

    fn source_exists(&self) -> bool {
        self.ctx
            .repository
            .disk_file(&self.file)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn push(&self, request: UploadRequest) -> bool {
        match self.queue.push(request) {
            Ok(()) => true,
            Err(PushError::Full) => {
                self.break_with(
                    TransferProblem::TransferException,
                    format!(
                        "대기 요청 상한 초과 ({}), 세션 종료",
                        self.queue.capacity()
                    ),
                );
                false
            }
            Err(PushError::Closed) => false,
        }
    }

    /// 세션 실행. 어떤 에러도 세션 밖으로 내보내지 않는다.
    pub async fn run(&self) -> Outcome {
        if let Err(e) = self.serve().await {
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

        self.status.set_state(TransferState::Completed);
        let counter = self.counter.lock();
        info!(
            "업로드 완료: {} -> {} ({} chunks, {} bytes, {:.2} MB/s)",
            self.file.name,
            self.peer,
            counter.total_chunks,
            counter.total_bytes,
            counter.average_rate() / 1_000_000.0
        );
        Outcome::Completed
    }

    async fn serve(&self) -> Result<()> {
        if self.queue.is_closed() {
            return Ok(());
        }

        let path = self
            .ctx
            .repository
            .disk_file(&self.file)
            .ok_or_else(|| Error::FileNotFound(PathBuf::from(&self.file.name)))?;
        let mut handle = match tokio::fs::File::open(&path).await {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        self.status.set_state(TransferState::Waiting);
        self.ctx.network.send_message(
            &self.peer,
            Message::StartUpload(StartUpload {
                file: self.file.clone(),
            }),
        )?;
        debug!("업로드 시작: {} -> {}", self.file.name, self.peer);

        // 첫 요청은 상태가 괜찮은 동안 무기한 대기
        if !self.queue.wait_nonempty(None).await {
            return Ok(());
        }

        if self.queue.peek() == Some(UploadRequest::PartsRecord) {
            self.queue.pop();
            self.send_parts_record(&path).await?;
            self.status.set_state(TransferState::RemoteMatching);
            if !self.queue.wait_nonempty(None).await {
                return Ok(());
            }
        }

        self.status.set_state(TransferState::Uploading);
        loop {
            // 주기마다 상태 점검, 괜찮으면 다시 대기
            let timeout = self.ctx.config.part_request_timeout();
            if !self.queue.wait_nonempty(Some(timeout)).await {
                if self.queue.is_closed() || self.health().state.is_finished() {
                    return Ok(());
                }
                debug!(
                    "{}ms 동안 요청 없음, 계속 대기: {} -> {}",
                    timeout.as_millis(),
                    self.file.name,
                    self.peer
                );
                continue;
            }

            match self.queue.pop() {
                None => continue,
                Some(UploadRequest::Stop) => {
                    debug!("StopUpload 수신: {}", self.file.name);
                    return Ok(());
                }
                Some(UploadRequest::PartsRecord) => self.send_parts_record(&path).await?,
                Some(UploadRequest::Part(request)) => {
                    self.send_part(&mut handle, &path, request).await?;
                }
            }
        }
    }

    async fn send_parts_record(&self, path: &Path) -> Result<()> {
        self.status.set_state(TransferState::FileHashing);
        let status = self.status.clone();
        let record = self
            .ctx
            .records
            .retrieve_record(
                &self.file,
                path.to_path_buf(),
                Arc::new(move |p: f64| status.set_progress(p)),
            )
            .await?;

        self.ctx.network.send_message(
            &self.peer,
            Message::ReplyFilePartsRecord(ReplyFilePartsRecord {
                file: self.file.clone(),
                record: (*record).clone(),
            }),
        )
    }

    async fn send_part(
        &self,
        handle: &mut tokio::fs::File,
        path: &Path,
        request: RequestPart,
    ) -> Result<()> {
        self.check_unchanged(path).await?;

        let range = request.range;
        let length = range.length as usize;
        let mut data = vec![0u8; length];
        handle.seek(SeekFrom::Start(range.start)).await?;

        let mut filled = 0;
        while filled < length {
            let n = handle.read(&mut data[filled..]).await?;
            if n == 0 {
                return Err(Error::Transfer(format!(
                    "파일 끝을 넘는 요청: {} (읽은 바이트 {})",
                    range, filled
                )));
            }
            filled += n;
        }

        self.ctx.limiter.acquire(length).await;

        let chunk = FileChunk::new(self.file.clone(), range.start, Bytes::from(data));
        {
            let _gate = self.send_gate.lock();
            if self.is_aborted() || self.queue.is_closed() {
                // 대기 중에 중단됨
                return Ok(());
            }
            self.ctx
                .network
                .send_message(&self.peer, Message::FileChunk(chunk))?;
        }

        self.counter.lock().chunk_transferred(length);
        self.ctx.stats.lock().upload.chunk_transferred(length);
        self.status.set_progress(request.progress);
        Ok(())
    }

    /// 디스크 파일이 세션의 파일 정보와 같은지 확인. 다르면 재스캔 요청 후 실패.
    async fn check_unchanged(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let modified = peer::modified_ms(&meta)?;
        if peer::dates_equal_cross_platform(modified, self.file.modified_ms)
            && meta.len() == self.file.size
        {
            return Ok(());
        }

        self.ctx.repository.scan_changed_file(&self.file);
        Err(Error::Transfer(format!(
            "전송 중 파일 변경됨: {} (modified {} -> {}, size {} -> {})",
            self.file.name,
            self.file.modified_ms,
            modified,
            self.file.size,
            meta.len()
        )))
    }
}
