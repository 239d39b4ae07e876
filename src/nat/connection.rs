//! NAT 통과 전송 핸들러
//!
//! 핸드쉐이크로 서로의 포트를 알게 된 두 노드가 같은 소켓으로 프로브를 주고받아
//! NAT 매핑을 연다 (홀 펀칭). 프로브가 오가면 연결 성립.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::ports::PortSlot;
use crate::peer::PeerId;
use crate::{Error, Result};

const PROBE: &[u8] = b"SWRP/probe";
const PROBE_ACK: &[u8] = b"SWRP/probe-ack";

/// 프로브 재전송 간격
const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// 두 노드 사이의 직접 UDP 채널
///
/// 포트 슬롯을 쥐고 있으며 drop 시 포트가 할당기로 돌아간다.
#[derive(Debug)]
pub struct UdtConnection {
    remote: PeerId,
    remote_addr: SocketAddr,
    socket: UdpSocket,
    lease: PortSlot,
}

impl UdtConnection {
    /// 슬롯의 소켓으로 `remote_addr` 와 프로브를 교환해 연결을 만든다
    pub async fn establish(
        mut lease: PortSlot,
        remote: PeerId,
        remote_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let std_socket = lease
            .take_socket()
            .ok_or_else(|| Error::Protocol(format!("포트 {} 소켓이 이미 사용됨", lease.port())))?;
        let socket = UdpSocket::from_std(std_socket)?;
        socket.connect(remote_addr).await?;

        rendezvous(&socket, &remote, timeout).await?;
        debug!(
            "UDT 연결 성립: {} (local {}, remote {})",
            remote,
            lease.port(),
            remote_addr
        );

        Ok(Self {
            remote,
            remote_addr,
            socket,
            lease,
        })
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_port(&self) -> u16 {
        self.lease.port()
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket.send(data).await?;
        Ok(())
    }

    /// 데이터그램 하나 수신 (늦게 도착한 프로브는 건너뜀)
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.socket.recv(buf).await?;
            let datagram = &buf[..n];
            if datagram == PROBE {
                // 상대가 아직 프로브 응답을 못 받았다
                let _ = self.socket.send(PROBE_ACK).await;
                continue;
            }
            if datagram == PROBE_ACK {
                continue;
            }
            return Ok(n);
        }
    }
}

/// 상대의 프로브 또는 프로브 응답을 받을 때까지 프로브 전송
async fn rendezvous(socket: &UdpSocket, remote: &PeerId, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    let mut buf = [0u8; 64];

    loop {
        let received = tokio::select! {
            _ = ticker.tick() => {
                // 상대 포트가 아직 열리지 않았으면 실패할 수 있다
                if let Err(e) = socket.send(PROBE).await {
                    trace!("프로브 전송 실패 ({}): {}", remote, e);
                }
                continue;
            }
            received = socket.recv(&mut buf) => received,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::Timeout(remote.clone()));
            }
        };

        match received {
            Ok(n) if &buf[..n] == PROBE => {
                socket.send(PROBE_ACK).await?;
                return Ok(());
            }
            Ok(n) if &buf[..n] == PROBE_ACK => return Ok(()),
            Ok(n) => trace!("프로브 단계에서 {} bytes 무시", n),
            // ICMP port unreachable 은 연결된 UDP 소켓의 recv 에러로 나타난다
            Err(e) => trace!("프로브 수신 에러 ({}): {}", remote, e),
        }
    }
}
