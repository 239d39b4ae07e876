//! 릴레이 노드를 통한 NAT 통과 연결

pub mod connection;
pub mod manager;
pub mod monitor;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::UdtConnection;
pub use manager::UdtConnectionManager;
pub use monitor::{MonitorGuard, ReplyMonitors};
pub use ports::{PortAllocator, PortSlot};
