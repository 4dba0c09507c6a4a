pub mod memory;
pub mod udp;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Frame;

/// Link/network address pair of a node.
///
/// The MAC is carried for the transports and frame fields that need it; a
/// transport that cannot know it leaves it empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeAddr {
    pub mac: String,
    pub ip: String,
}

impl NodeAddr {
    pub fn new(mac: &str, ip: &str) -> NodeAddr {
        NodeAddr { mac: mac.to_string(), ip: ip.to_string() }
    }
}

/// The sending/receiving seam of the protocol engine.
///
/// Implementations deliver whole frames; malformed datagrams are dropped
/// inside the implementation and never surface through `recv`.
#[async_trait]
pub trait Wire: Send + Sync {
    /// Sends one frame toward `dst`.
    async fn send(&self, dst: &NodeAddr, frame: Frame) -> Result<()>;

    /// Waits for the next well-formed inbound frame and its source address.
    async fn recv(&self) -> Result<(NodeAddr, Frame)>;
}
