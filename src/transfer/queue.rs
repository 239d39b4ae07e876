//! 업로드 세션의 대기 요청 큐
//!
//! 메시지 수신 측(생산자)과 세션 송신 루프(소비자) 하나가 공유한다. FIFO, 상한 초과 시 거부.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::RequestPart;

/// 업로드 측이 처리할 요청
#[derive(Debug, Clone, PartialEq)]
pub enum UploadRequest {
    Part(RequestPart),
    PartsRecord,
    Stop,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<UploadRequest>,
    closed: bool,
}

#[derive(Debug)]
pub struct PendingRequests {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

/// push 실패 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, request: UploadRequest) -> Result<(), PushError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed);
            }
            if state.requests.len() >= self.capacity {
                return Err(PushError::Full);
            }
            state.requests.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// 쌓인 요청을 버리고 종료 요청을 넣는다
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.requests.clear();
            state.requests.push_back(UploadRequest::Stop);
        }
        self.notify.notify_one();
    }

    /// 같은 구간 요청 제거. 제거했으면 true.
    pub fn cancel(&self, request: &RequestPart) -> bool {
        let mut state = self.state.lock();
        let before = state.requests.len();
        state.requests.retain(|queued| match queued {
            UploadRequest::Part(part) => !part.same_request(request),
            _ => true,
        });
        before != state.requests.len()
    }

    /// 큐를 비우고 닫는다. 대기자는 곧바로 깨어난다.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.requests.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pop(&self) -> Option<UploadRequest> {
        self.state.lock().requests.pop_front()
    }

    pub fn peek(&self) -> Option<UploadRequest> {
        self.state.lock().requests.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 요청이 들어오거나 큐가 닫힐 때까지 대기 (`timeout` 이 None 이면 무기한)
    ///
    /// 요청이 있으면 true, 타임아웃 또는 닫힘이면 false.
    pub async fn wait_nonempty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                if !state.requests.is_empty() {
                    return true;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return !self.is_empty() && !self.is_closed();
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::FileInfo;
    use crate::range::Range;
    use std::sync::Arc;

    fn part(start: u64) -> UploadRequest {
        UploadRequest::Part(RequestPart::new(
            FileInfo::new("f", "a", 100, 0, 1),
            Range::new(start, 10),
            0.0,
        ))
    }

    #[test]
    fn test_bound_and_fifo() {
        let queue = PendingRequests::new(3);
        for i in 0..3 {
            queue.push(part(i * 10)).unwrap();
        }
        assert_eq!(queue.push(part(30)), Err(PushError::Full));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(part(0)));
        assert_eq!(queue.pop(), Some(part(10)));
    }

    #[test]
    fn test_stop_clears_and_cancel_removes() {
        let queue = PendingRequests::new(10);
        queue.push(part(0)).unwrap();
        queue.push(part(10)).unwrap();

        let UploadRequest::Part(target) = part(10) else { unreachable!() };
        assert!(queue.cancel(&target));
        assert!(!queue.cancel(&target));
        assert_eq!(queue.len(), 1);

        queue.stop();
        assert_eq!(queue.pop(), Some(UploadRequest::Stop));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_push_and_close() {
        let queue = Arc::new(PendingRequests::new(10));
        assert!(!queue.wait_nonempty(Some(Duration::from_millis(10))).await);

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(part(0)).unwrap();
        });
        assert!(queue.wait_nonempty(None).await);

        let closer = queue.clone();
        queue.pop();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert!(!queue.wait_nonempty(None).await);
        assert_eq!(queue.push(part(0)), Err(PushError::Closed));
    }
}
