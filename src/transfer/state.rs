//! 전송 세션 상태

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TransferProblem;

/// 세션 상태 머신
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Initializing,
    /// 워커 허가 또는 첫 요청 대기
    Waiting,
    /// 업로드 측 parts record 계산 중
    FileHashing,
    /// 상대가 record 와 자기 파일을 비교 중
    RemoteMatching,
    /// 다운로드 측 로컬 파일 매칭 중
    Matching,
    Uploading,
    Downloading,
    Completed,
    Broken,
    Aborted,
}

impl TransferState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Broken | TransferState::Aborted
        )
    }
}

/// 상태 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub state: TransferState,

    /// 현재 단계 진행률 (0.0 ~ 1.0)
    pub progress: f64,

    /// 깨졌을 때 사유
    pub problem: Option<(TransferProblem, String)>,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            state: TransferState::Initializing,
            progress: 0.0,
            problem: None,
        }
    }
}

/// 세션과 코디네이터가 함께 보는 상태 핸들
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<TransferStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TransferStatus {
        self.inner.lock().clone()
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    /// 상태 전이 (종료 상태에서는 무시)
    pub fn set_state(&self, state: TransferState) {
        let mut status = self.inner.lock();
        if !status.state.is_finished() {
            status.state = state;
            status.progress = 0.0;
        }
    }

    pub fn set_progress(&self, progress: f64) {
        let mut status = self.inner.lock();
        if !status.state.is_finished() {
            status.progress = progress.clamp(0.0, 1.0);
        }
    }

    /// 깨짐 표시. 처음 표시한 사유만 남고, 처음이면 true.
    pub fn mark_broken(&self, problem: TransferProblem, message: impl Into<String>) -> bool {
        let mut status = self.inner.lock();
        if status.state.is_finished() {
            return false;
        }
        status.state = TransferState::Broken;
        status.problem = Some((problem, message.into()));
        true
    }

    pub fn problem(&self) -> Option<(TransferProblem, String)> {
        self.inner.lock().problem.clone()
    }
}

/// 세션 실행 결과
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Broken(TransferProblem, String),
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_break_wins() {
        let status = StatusHandle::new();
        status.set_state(TransferState::Uploading);

        assert!(status.mark_broken(TransferProblem::InvalidPart, "bad range"));
        assert!(!status.mark_broken(TransferProblem::IoException, "later"));
        status.set_state(TransferState::Completed);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, TransferState::Broken);
        assert_eq!(snapshot.problem.unwrap().0, TransferProblem::InvalidPart);
    }
}
