//! 길이 접두 프레임 TCP 채널 (데모용 PeerNetwork 구현)
//!
//! 프레임: `u32 BE 길이` + `Message::to_bytes()`.
//! 연결 직후 양쪽이 Identify 프레임을 먼저 교환한다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{Identify, Message};
use crate::nat::UdtConnection;
use crate::network::PeerNetwork;
use crate::peer::PeerId;
use crate::{Error, Result};

/// 프레임 최대 크기
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Identify 교환 타임아웃
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// 채널 이벤트
#[derive(Debug)]
pub enum NetworkEvent {
    Connected(PeerId),
    Message(PeerId, Message),
    Disconnected(PeerId),
}

struct Link {
    id: u64,
    addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// 노드별 TCP 연결 묶음
pub struct TcpNetwork {
    me: PeerId,
    links: DashMap<PeerId, Link>,
    next_link: AtomicU64,
    relay: Mutex<Option<PeerId>>,
    direct: DashMap<PeerId, UdtConnection>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

impl TcpNetwork {
    pub fn new(me: PeerId) -> (Arc<Self>, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let network = Arc::new(Self {
            me,
            links: DashMap::new(),
            next_link: AtomicU64::new(1),
            relay: Mutex::new(None),
            direct: DashMap::new(),
            events,
        });
        (network, rx)
    }

    pub fn set_relay(&self, relay: Option<PeerId>) {
        *self.relay.lock() = relay;
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }

    /// 연결 끊기. 상대 쪽에는 Disconnected 이벤트가 발생한다.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        // sender 가 drop 되면 송신 태스크가 쓰기 방향을 닫는다
        self.links.remove(peer).is_some()
    }

    /// NAT 통과로 만들어진 직접 채널 꺼내기
    pub fn take_direct(&self, peer: &PeerId) -> Option<UdtConnection> {
        self.direct.remove(peer).map(|(_, c)| c)
    }

    /// 수신 대기 시작. 실제 바인드된 주소 반환.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("{} 수신 대기: {}", self.me, local);

        let network = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept 실패: {}", e);
                        continue;
                    }
                };
                let network = network.clone();
                tokio::spawn(async move {
                    if let Err(e) = network.attach(stream, remote).await {
                        warn!("{} 연결 수립 실패: {}", remote, e);
                    }
                });
            }
        });
        Ok((local, handle))
    }

    /// 원격 노드에 연결하고 상대 ID 반환
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId> {
        let stream = TcpStream::connect(addr).await?;
        self.attach(stream, addr).await
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<PeerId> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = Message::Identify(Identify {
            peer: self.me.clone(),
        });
        write_frame(&mut writer, &hello).await?;

        let peer = match tokio::time::timeout(IDENTIFY_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(Some(Message::Identify(identify)))) => identify.peer,
            Ok(Ok(Some(other))) => {
                return Err(Error::Protocol(format!(
                    "첫 프레임이 Identify 가 아님: {:?}",
                    other.msg_type()
                )))
            }
            Ok(Ok(None)) => return Err(Error::ConnectionClosed),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Protocol(format!("{} Identify 타임아웃", addr))),
        };

        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Some(previous) = self.links.insert(peer.clone(), Link { id, addr, outgoing }) {
            debug!("{} 기존 연결 교체 (link {})", peer, previous.id);
        }
        info!("{} 연결됨 ({})", peer, addr);
        let _ = self.events.send(NetworkEvent::Connected(peer.clone()));

        // 송신 태스크: 링크가 교체되거나 끊기면 sender 가 drop 되어 끝난다
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    debug!("{} 로 전송 실패: {}", writer_peer, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        // 수신 태스크
        let network = self.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(message)) => {
                        let _ = network
                            .events
                            .send(NetworkEvent::Message(reader_peer.clone(), message));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{} 수신 에러: {}", reader_peer, e);
                        break;
                    }
                }
            }
            let removed = network
                .links
                .remove_if(&reader_peer, |_, link| link.id == id);
            if removed.is_some() {
                info!("{} 연결 끊김", reader_peer);
                let _ = network.events.send(NetworkEvent::Disconnected(reader_peer));
            }
        });

        Ok(peer)
    }
}

impl PeerNetwork for TcpNetwork {
    fn myself(&self) -> &PeerId {
        &self.me
    }

    fn send_message(&self, peer: &PeerId, message: Message) -> Result<()> {
        let link = self
            .links
            .get(peer)
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        link.outgoing
            .send(message)
            .map_err(|_| Error::NotConnected(peer.clone()))
    }

    fn is_completely_connected(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    fn relay(&self) -> Option<PeerId> {
        self.relay.lock().clone()
    }

    fn connect_address(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.links.get(peer).map(|link| link.addr)
    }

    fn accept_connection(&self, connection: UdtConnection) {
        info!(
            "{} 직접 채널 수락 (local port {})",
            connection.remote(),
            connection.local_port()
        );
        self.direct.insert(connection.remote().clone(), connection);
    }
}

/// 프레임 하나 쓰기
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = message.to_bytes()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("프레임 크기 초과: {}", bytes.len())));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// 프레임 하나 읽기. 깔끔하게 닫히면 `Ok(None)`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("프레임 크기 초과: {}", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Message::from_bytes(&buf).map(Some)
}
