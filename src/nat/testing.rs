//! 테스트용 인메모리 노드 네트워크 (UDT 핸드쉐이크만 전달)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::{UdtConnection, UdtConnectionManager};
use crate::message::{Message, UdtKind};
use crate::network::PeerNetwork;
use crate::peer::PeerId;
use crate::{Config, Error, Result};

#[derive(Default)]
struct HubInner {
    nodes: DashMap<PeerId, Weak<UdtConnectionManager>>,
    blackholes: DashSet<PeerId>,
    accepted: DashMap<PeerId, Vec<UdtConnection>>,
    syn_sent: DashMap<PeerId, usize>,
    // 노드가 drop 되지 않도록 보관
    keep: Mutex<Vec<Arc<UdtConnectionManager>>>,
}

#[derive(Clone, Default)]
pub(crate) struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, name: &str, relay: Option<&str>, config: Config) -> Arc<UdtConnectionManager> {
        let network = Arc::new(HubNetwork {
            me: PeerId::new(name),
            relay: relay.map(PeerId::new),
            hub: Arc::downgrade(&self.inner),
        });
        let manager = Arc::new(UdtConnectionManager::new(config, network));
        self.inner
            .nodes
            .insert(PeerId::new(name), Arc::downgrade(&manager));
        self.inner.keep.lock().push(manager.clone());
        manager
    }

    /// 이 노드로 가는 메시지는 모두 버려진다
    pub fn blackhole(&self, name: &str) {
        self.inner.blackholes.insert(PeerId::new(name));
    }

    pub fn sent_syn_count(&self, name: &str) -> usize {
        self.inner
            .syn_sent
            .get(&PeerId::new(name))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub async fn wait_accepted(&self, name: &str) -> UdtConnection {
        let peer = PeerId::new(name);
        for _ in 0..500 {
            if let Some(connection) = self
                .inner
                .accepted
                .get_mut(&peer)
                .and_then(|mut list| list.pop())
            {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} 가 연결을 수락하지 않음", name);
    }
}

struct HubNetwork {
    me: PeerId,
    relay: Option<PeerId>,
    hub: Weak<HubInner>,
}

impl HubNetwork {
    fn hub(&self) -> Result<Arc<HubInner>> {
        self.hub.upgrade().ok_or(Error::ConnectionClosed)
    }
}

impl PeerNetwork for HubNetwork {
    fn myself(&self) -> &PeerId {
        &self.me
    }

    fn send_message(&self, peer: &PeerId, message: Message) -> Result<()> {
        let hub = self.hub()?;
        let Message::Udt(udt) = message else {
            return Ok(());
        };
        if udt.kind == UdtKind::Syn && udt.source == self.me {
            *hub.syn_sent.entry(self.me.clone()).or_insert(0) += 1;
        }
        if hub.blackholes.contains(peer) {
            return Ok(());
        }

        let target = hub
            .nodes
            .get(peer)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        target.handle_udt_message(&self.me, udt);
        Ok(())
    }

    fn is_completely_connected(&self, peer: &PeerId) -> bool {
        self.hub()
            .map(|hub| hub.nodes.contains_key(peer) || hub.blackholes.contains(peer))
            .unwrap_or(false)
    }

    fn relay(&self) -> Option<PeerId> {
        self.relay.clone()
    }

    fn connect_address(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.is_completely_connected(peer)
            .then(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    fn accept_connection(&self, connection: UdtConnection) {
        if let Ok(hub) = self.hub() {
            hub.accepted
                .entry(self.me.clone())
                .or_default()
                .push(connection);
        }
    }
}
