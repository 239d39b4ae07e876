//! 핸드쉐이크 응답 대기자
//!
//! 대상 노드당 하나. 시작 측이 SYN 을 보내기 전에 등록하고, 응답(ACK/NACK)이 오면
//! 대기 중인 태스크 하나를 깨운다. 가드가 drop 되면 항목도 사라진다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::message::UdtMessage;
use crate::peer::PeerId;

#[derive(Debug, Default)]
struct ReplyMonitor {
    reply: Mutex<Option<UdtMessage>>,
    /// 받은 응답 수 (이미 꺼내 간 것 포함)
    received: AtomicUsize,
    notify: Notify,
}

/// 대상 노드 → 응답 대기자
#[derive(Debug, Default, Clone)]
pub struct ReplyMonitors {
    monitors: Arc<DashMap<PeerId, Arc<ReplyMonitor>>>,
}

impl ReplyMonitors {
    pub fn new() -> Self {
        Self::default()
    }

    /// 대기자 등록. 이미 진행 중인 핸드쉐이크가 있으면 None.
    pub fn register(&self, target: &PeerId) -> Option<MonitorGuard> {
        match self.monitors.entry(target.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let monitor = Arc::new(ReplyMonitor::default());
                entry.insert(monitor.clone());
                Some(MonitorGuard {
                    target: target.clone(),
                    monitor,
                    monitors: self.monitors.clone(),
                })
            }
        }
    }

    /// 응답 전달. 대기자가 없으면 버리고 false.
    pub fn deliver(&self, reply: UdtMessage) -> bool {
        let Some(monitor) = self.monitors.get(&reply.source).map(|m| m.value().clone()) else {
            error!("대기 중인 핸드쉐이크 없음, 응답 버림: {}", reply);
            return false;
        };

        {
            let mut slot = monitor.reply.lock();
            if monitor.received.fetch_add(1, Ordering::SeqCst) > 0 {
                // 어느 쪽이 맞는지 알 수 없으므로 나중 것을 쓴다
                match slot.as_ref() {
                    Some(previous) => {
                        warn!("중복 핸드쉐이크 응답: 이전 {}, 새 {}", previous, reply)
                    }
                    None => warn!("이미 처리한 핸드쉐이크에 응답 추가: {}", reply),
                }
            }
            *slot = Some(reply);
        }
        monitor.notify.notify_one();
        true
    }

    pub fn is_pending(&self, target: &PeerId) -> bool {
        self.monitors.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

/// 등록된 대기자 하나 (drop 시 등록 해제)
#[derive(Debug)]
pub struct MonitorGuard {
    target: PeerId,
    monitor: Arc<ReplyMonitor>,
    monitors: Arc<DashMap<PeerId, Arc<ReplyMonitor>>>,
}

impl MonitorGuard {
    pub fn target(&self) -> &PeerId {
        &self.target
    }

    /// 지금까지 받은 응답 수. 1 보다 크면 중복 응답이 있었다.
    pub fn replies_received(&self) -> usize {
        self.monitor.received.load(Ordering::SeqCst)
    }

    /// 응답이 올 때까지 최대 `timeout` 대기
    pub async fn wait(&self, timeout: Duration) -> Option<UdtMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.monitor.notify.notified();
            if let Some(reply) = self.monitor.reply.lock().take() {
                return Some(reply);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.monitor.reply.lock().take();
            }
        }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        let monitor = &self.monitor;
        self.monitors
            .remove_if(&self.target, |_, registered| Arc::ptr_eq(registered, monitor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UdtKind;

    fn peers() -> (PeerId, PeerId) {
        (PeerId::new("initiator"), PeerId::new("target"))
    }

    #[tokio::test]
    async fn test_reply_wakes_waiter() {
        let (me, target) = peers();
        let monitors = ReplyMonitors::new();
        let guard = monitors.register(&target).unwrap();

        let sender = monitors.clone();
        let ack = UdtMessage::ack(target.clone(), me.clone(), 47_900);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.deliver(ack);
        });

        let reply = guard.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.kind, UdtKind::Ack);
        assert_eq!(reply.port, Some(47_900));
    }

    #[tokio::test]
    async fn test_reply_before_wait_is_kept() {
        let (me, target) = peers();
        let monitors = ReplyMonitors::new();
        let guard = monitors.register(&target).unwrap();

        assert!(monitors.deliver(UdtMessage::nack(target.clone(), me.clone())));
        let reply = guard.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply.kind, UdtKind::Nack);
    }

    #[tokio::test]
    async fn test_duplicate_reply_keeps_newest() {
        let (me, target) = peers();
        let monitors = ReplyMonitors::new();
        let guard = monitors.register(&target).unwrap();

        monitors.deliver(UdtMessage::nack(target.clone(), me.clone()));
        monitors.deliver(UdtMessage::ack(target.clone(), me.clone(), 47_901));

        let reply = guard.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply.kind, UdtKind::Ack);
        assert_eq!(guard.replies_received(), 2);
    }

    #[tokio::test]
    async fn test_reply_after_consumed_counts_as_duplicate() {
        let (me, target) = peers();
        let monitors = ReplyMonitors::new();
        let guard = monitors.register(&target).unwrap();

        monitors.deliver(UdtMessage::ack(target.clone(), me.clone(), 47_902));
        let first = guard.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.port, Some(47_902));
        assert_eq!(guard.replies_received(), 1);

        // 이미 꺼낸 뒤에 온 응답도 중복으로 센다
        assert!(monitors.deliver(UdtMessage::nack(target.clone(), me.clone())));
        assert_eq!(guard.replies_received(), 2);
        let second = guard.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.kind, UdtKind::Nack);
    }

    #[tokio::test]
    async fn test_timeout_and_cleanup() {
        let (me, target) = peers();
        let monitors = ReplyMonitors::new();
        {
            let guard = monitors.register(&target).unwrap();
            assert!(monitors.register(&target).is_none());
            assert!(guard.wait(Duration::from_millis(20)).await.is_none());
        }
        assert!(monitors.is_empty());
        assert!(!monitors.deliver(UdtMessage::nack(target.clone(), me)));
        assert!(monitors.register(&target).is_some());
    }
}
