//! NAT 통과용 UDP 포트 할당기
//!
//! 설정된 포트 범위에서 포트 하나당 소켓 하나만 바인드되도록 관리한다.
//! 바인드에 실패한 포트는 다른 프로세스가 쓰는 것으로 보고 프로세스 수명 동안 제외한다.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::peer::PeerId;
use crate::range::Range;
use crate::{Error, Result};

/// 포트 상태 (맵에 없으면 free)
#[derive(Debug, Clone, PartialEq, Eq)]
enum PortState {
    /// 바인드 실패. 다시 시도하지 않는다.
    Locked,
    /// 진행 중인 핸드쉐이크/연결 하나가 사용 중
    Allocated { peer: PeerId },
}

#[derive(Debug)]
struct Inner {
    first: u16,
    count: usize,
    bind_address: Option<IpAddr>,
    ports: Mutex<BTreeMap<u16, PortState>>,
}

/// 포트 할당기 (복제해도 같은 포트 맵을 공유)
#[derive(Debug, Clone)]
pub struct PortAllocator {
    inner: Arc<Inner>,
}

impl PortAllocator {
    pub fn new(range: Range, bind_address: Option<IpAddr>) -> Self {
        let first = range.start.min(u16::MAX as u64) as u16;
        // 포트 번호 공간을 넘는 부분은 잘라낸다
        let count = range.length.min(u16::MAX as u64 + 1 - first as u64) as usize;
        Self {
            inner: Arc::new(Inner {
                first,
                count,
                bind_address,
                ports: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn candidates(&self) -> impl Iterator<Item = u16> {
        let first = self.inner.first;
        (0..self.inner.count).map(move |i| first + i as u16)
    }

    /// 첫 번째 free 포트에 소켓을 바인드해 슬롯으로 돌려준다
    ///
    /// 바인드는 락을 잡은 채로 수행한다. 같은 포트를 두 슬롯이 갖는 일은 없다.
    pub fn allocate(&self, peer: &PeerId) -> Result<PortSlot> {
        let ip = self
            .inner
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let mut ports = self.inner.ports.lock();
        for port in self.candidates() {
            if ports.contains_key(&port) {
                continue;
            }

            match UdpSocket::bind(SocketAddr::new(ip, port)) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    ports.insert(port, PortState::Allocated { peer: peer.clone() });
                    debug!("UDT 포트 {} 할당 ({})", port, peer);
                    return Ok(PortSlot {
                        peer: peer.clone(),
                        port,
                        socket: Some(socket),
                        allocator: self.clone(),
                    });
                }
                Err(e) => {
                    trace!("포트 {} 바인드 실패, 잠금 처리: {}", port, e);
                    ports.insert(port, PortState::Locked);
                }
            }
        }

        Err(Error::NoPortsAvailable)
    }

    /// 포트를 free 로 되돌린다 (이미 free 여도 무해)
    pub fn release(&self, port: u16) {
        if self.inner.ports.lock().remove(&port).is_some() {
            debug!("UDT 포트 {} 반환", port);
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.count - self.inner.ports.lock().len()
    }

    pub fn allocated_count(&self) -> usize {
        self.inner
            .ports
            .lock()
            .values()
            .filter(|s| matches!(s, PortState::Allocated { .. }))
            .count()
    }

    pub fn is_locked(&self, port: u16) -> bool {
        self.inner.ports.lock().get(&port) == Some(&PortState::Locked)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        matches!(
            self.inner.ports.lock().get(&port),
            Some(PortState::Allocated { .. })
        )
    }
}

/// 할당된 포트 하나 (drop 시 포트 반환)
#[derive(Debug)]
pub struct PortSlot {
    peer: PeerId,
    port: u16,
    socket: Option<UdpSocket>,
    allocator: PortAllocator,
}

impl PortSlot {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 바인드된 소켓을 꺼낸다. 포트 소유권은 슬롯에 남는다.
    pub fn take_socket(&mut self) -> Option<UdpSocket> {
        self.socket.take()
    }
}

impl Drop for PortSlot {
    fn drop(&mut self) {
        // 소켓을 먼저 닫고 포트를 반환해야 재할당 시 바인드가 성공한다
        drop(self.socket.take());
        self.allocator.release(self.port);
    }
}
