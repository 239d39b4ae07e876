//! 릴레이 경유 NAT 통과 코디네이터
//!
//! 시작 측: SYN(포트) → 릴레이 → 대상, 대상: ACK(포트)/NACK → 릴레이 → 시작 측.
//! ACK 를 받으면 양쪽이 알려준 포트로 프로브를 교환해 직접 채널을 만든다.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connection::UdtConnection;
use super::monitor::ReplyMonitors;
use super::ports::PortAllocator;
use crate::message::{Message, UdtKind, UdtMessage};
use crate::network::PeerNetwork;
use crate::peer::PeerId;
use crate::{Config, Error, Result};

/// NAT 통과 연결 관리자
pub struct UdtConnectionManager {
    config: Config,
    network: Arc<dyn PeerNetwork>,
    ports: PortAllocator,
    replies: ReplyMonitors,
}

impl UdtConnectionManager {
    pub fn new(config: Config, network: Arc<dyn PeerNetwork>) -> Self {
        let ports = PortAllocator::new(config.udt_port_range, config.bind_address);
        Self {
            config,
            network,
            ports,
            replies: ReplyMonitors::new(),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn is_connecting(&self, target: &PeerId) -> bool {
        self.replies.is_pending(target)
    }

    /// 릴레이를 거쳐 `target` 과 직접 채널을 만든다
    ///
    /// 실패하면 할당했던 포트는 반환된 상태다.
    pub async fn connect(&self, target: &PeerId) -> Result<UdtConnection> {
        let myself = self.network.myself().clone();
        if *target == myself {
            return Err(Error::LoopbackConnection);
        }
        let relay = self.network.relay().ok_or_else(|| Error::NoRelay {
            target: target.clone(),
        })?;

        let slot = self.ports.allocate(target).map_err(|e| {
            warn!("{} 연결용 포트 할당 실패: {}", target, e);
            Error::PortSelectionFailed
        })?;

        // slot 은 이후 어떤 실패 경로에서든 drop 되며 포트를 반환한다
        let monitor = self
            .replies
            .register(target)
            .ok_or_else(|| Error::AlreadyConnecting(target.clone()))?;

        let syn = UdtMessage::syn(myself, target.clone(), slot.port());
        debug!("SYN 전송 ({} 경유): {}", relay, syn);
        self.network.send_message(&relay, Message::Udt(syn))?;

        let reply = monitor
            .wait(self.config.udt_connection_timeout())
            .await
            .ok_or_else(|| Error::Timeout(target.clone()))?;
        drop(monitor);

        match (reply.kind, reply.port) {
            (UdtKind::Ack, Some(port)) => {
                let addr = self.remote_address(target, port)?;
                info!("{} 가 UDT 연결 수락 (port {})", target, port);
                UdtConnection::establish(
                    slot,
                    target.clone(),
                    addr,
                    self.config.udt_rendezvous_timeout(),
                )
                .await
            }
            (UdtKind::Nack, _) => Err(Error::ConnectionRefused(target.clone())),
            _ => Err(Error::Protocol(format!("예상하지 못한 핸드쉐이크 응답: {}", reply))),
        }
    }

    /// 네트워크에서 받은 UDT 메시지 처리
    pub fn handle_udt_message(self: &Arc<Self>, from: &PeerId, message: UdtMessage) {
        if message.destination != *self.network.myself() {
            self.forward(from, message);
            return;
        }

        match message.kind {
            UdtKind::Syn => self.accept_syn(from, message),
            UdtKind::Ack | UdtKind::Nack => {
                self.replies.deliver(message);
            }
        }
    }

    /// 다른 노드 사이의 핸드쉐이크 중계
    fn forward(&self, from: &PeerId, message: UdtMessage) {
        let destination = message.destination.clone();
        if self.network.is_completely_connected(&destination) {
            debug!("UDT 메시지 중계: {}", message);
            self.network
                .send_message_async(&destination, Message::Udt(message));
        } else {
            debug!("중계 대상 {} 미연결, NACK 회신", destination);
            let nack = UdtMessage::nack(destination, message.source);
            self.network.send_message_async(from, Message::Udt(nack));
        }
    }

    /// 대상 측: SYN 수신
    fn accept_syn(self: &Arc<Self>, relay: &PeerId, syn: UdtMessage) {
        let myself = self.network.myself().clone();
        let initiator = syn.source.clone();

        if !self.config.udt_connections_enabled {
            debug!("UDT 연결 비활성화, {} 거부", initiator);
            self.network.send_message_async(
                relay,
                Message::Udt(UdtMessage::nack(myself, initiator)),
            );
            return;
        }

        let Some(remote_port) = syn.port else {
            warn!("포트 없는 SYN: {}", syn);
            self.network.send_message_async(
                relay,
                Message::Udt(UdtMessage::nack(myself, initiator)),
            );
            return;
        };

        let manager = self.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            let slot = match manager.ports.allocate(&initiator) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("{} 의 SYN 거부, 포트 할당 실패: {}", initiator, e);
                    manager.network.send_message_async(
                        &relay,
                        Message::Udt(UdtMessage::nack(myself, initiator)),
                    );
                    return;
                }
            };

            let ack = UdtMessage::ack(myself, initiator.clone(), slot.port());
            if let Err(e) = manager.network.send_message(&relay, Message::Udt(ack)) {
                warn!("ACK 전송 실패 ({}): {}", initiator, e);
                return;
            }

            let established = match manager.remote_address(&initiator, remote_port) {
                Ok(addr) => {
                    UdtConnection::establish(
                        slot,
                        initiator.clone(),
                        addr,
                        manager.config.udt_rendezvous_timeout(),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            // 실패 시 슬롯은 이미 drop 되었고, 시작 측은 타임아웃으로 끝난다
            match established {
                Ok(connection) => {
                    info!("{} 의 UDT 연결 수락", initiator);
                    manager.network.accept_connection(connection);
                }
                Err(e) => warn!("{} 와 UDT 연결 실패: {}", initiator, e),
            }
        });
    }

    fn remote_address(&self, peer: &PeerId, port: u16) -> Result<SocketAddr> {
        let addr = self
            .network
            .connect_address(peer)
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        Ok(SocketAddr::new(addr.ip(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::testing::LoopbackHub;
    use crate::range::Range;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    fn config(port_start: u64, timeout_ms: u64) -> Config {
        Config {
            udt_port_range: Range::new(port_start, 4),
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            udt_connection_timeout_ms: timeout_ms,
            udt_rendezvous_timeout_ms: 2_000,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_loopback_and_no_relay() {
        let hub = LoopbackHub::new();
        let a = hub.node("a", None, config(47_880, 500));

        let err = a.connect(&PeerId::new("a")).await.unwrap_err();
        assert!(matches!(err, Error::LoopbackConnection));

        let err = a.connect(&PeerId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::NoRelay { .. }));
        assert_eq!(a.ports().free_count(), 4);
    }

    #[tokio::test]
    async fn test_handshake_through_relay() {
        let hub = LoopbackHub::new();
        let _relay = hub.node("relay", None, config(47_890, 5_000));
        let a = hub.node("a", Some("relay"), config(47_900, 5_000));
        let b = hub.node("b", Some("relay"), config(47_910, 5_000));

        let connection = a.connect(&PeerId::new("b")).await.unwrap();
        assert_eq!(connection.remote(), &PeerId::new("b"));
        assert_eq!(a.ports().allocated_count(), 1);

        let accepted = hub.wait_accepted("b").await;
        assert_eq!(accepted.remote(), &PeerId::new("a"));
        assert_eq!(b.ports().allocated_count(), 1);

        connection.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = accepted.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(!a.is_connecting(&PeerId::new("b")));
    }

    #[tokio::test]
    async fn test_timeout_restores_port() {
        let hub = LoopbackHub::new();
        // 릴레이가 메시지를 삼킨다
        hub.blackhole("relay");
        let a = hub.node("a", Some("relay"), config(47_920, 200));

        let started = Instant::now();
        let err = a.connect(&PeerId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(a.ports().free_count(), 4);
        assert!(!a.is_connecting(&PeerId::new("b")));
    }

    #[tokio::test]
    async fn test_nack_fails_fast() {
        let hub = LoopbackHub::new();
        let _relay = hub.node("relay", None, config(47_930, 30_000));
        let a = hub.node("a", Some("relay"), config(47_940, 30_000));
        let _b = hub.node(
            "b",
            Some("relay"),
            Config {
                udt_connections_enabled: false,
                ..config(47_950, 30_000)
            },
        );

        let started = Instant::now();
        let err = a.connect(&PeerId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.ports().free_count(), 4);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_nacked_by_relay() {
        let hub = LoopbackHub::new();
        let _relay = hub.node("relay", None, config(47_960, 30_000));
        let a = hub.node("a", Some("relay"), config(47_970, 30_000));

        let err = a.connect(&PeerId::new("nobody")).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_single_handshake_per_target() {
        let hub = LoopbackHub::new();
        hub.blackhole("relay");
        let a = hub.node("a", Some("relay"), config(47_980, 500));

        let first = {
            let a = a.clone();
            tokio::spawn(async move { a.connect(&PeerId::new("b")).await })
        };
        while !a.is_connecting(&PeerId::new("b")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = a.connect(&PeerId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnecting(_)));
        // 두 번째 시도의 포트는 곧바로 반환된다
        assert_eq!(a.ports().allocated_count(), 1);
        assert_eq!(hub.sent_syn_count("a"), 1);

        assert!(matches!(first.await.unwrap(), Err(Error::Timeout(_))));
        assert_eq!(a.ports().free_count(), 4);
    }
}
