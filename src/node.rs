//! 전송 코디네이터와 NAT 통과 코디네이터를 묶은 노드

use std::sync::Arc;

use tracing::debug;

use crate::message::Message;
use crate::nat::{UdtConnection, UdtConnectionManager};
use crate::network::{FolderRepository, PeerNetwork};
use crate::peer::PeerId;
use crate::transfer::TransferManager;
use crate::{Config, Result};

/// 노드 하나의 전송 코어
///
/// 메시징 계층은 받은 메시지를 모두 [`Node::handle_message`] 로 넘기면 된다.
#[derive(Clone)]
pub struct Node {
    transfers: Arc<TransferManager>,
    udt: Arc<UdtConnectionManager>,
}

impl Node {
    pub fn new(
        config: Config,
        network: Arc<dyn PeerNetwork>,
        repository: Arc<dyn FolderRepository>,
    ) -> Result<Self> {
        let udt = Arc::new(UdtConnectionManager::new(config.clone(), network.clone()));
        let transfers = TransferManager::new(config, network, repository)?;
        Ok(Self { transfers, udt })
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn udt(&self) -> &Arc<UdtConnectionManager> {
        &self.udt
    }

    /// 받은 메시지를 담당 코디네이터로 분배
    pub fn handle_message(&self, from: &PeerId, message: Message) {
        match message {
            Message::Udt(udt) => self.udt.handle_udt_message(from, udt),
            Message::Identify(identify) => {
                debug!("{} 식별 프레임 수신 ({})", from, identify.peer);
            }
            other => self.transfers.handle_message(from, other),
        }
    }

    /// 릴레이를 거쳐 직접 채널 생성
    pub async fn connect(&self, target: &PeerId) -> Result<UdtConnection> {
        self.udt.connect(target).await
    }

    /// 메시징 계층이 연결 끊김을 알릴 때 호출
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.transfers.peer_disconnected(peer);
    }
}
