use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::net::{NodeAddr, Wire};
use crate::protocol::{Frame, FrameCodec};

/// Datagram transport: one frame per UDP datagram, all nodes on a fixed
/// port. The link-layer source address is not observable here, so inbound
/// addresses carry an empty MAC.
pub struct UdpWire {
    socket: UdpSocket,
    port: u16,
}

impl UdpWire {
    /// Binds the protocol socket on the given local IP and port.
    pub async fn bind(local_ip: &str, port: u16) -> Result<UdpWire> {
        let socket = UdpSocket::bind((local_ip, port)).await?;
        Ok(UdpWire { socket, port })
    }
}

#[async_trait]
impl Wire for UdpWire {
    async fn send(&self, dst: &NodeAddr, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf)?;
        self.socket
            .send_to(&buf, (dst.ip.as_str(), self.port))
            .await
            .map_err(|e| Error::Network(format!("send to {} failed: {}", dst.ip, e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(NodeAddr, Frame)> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| Error::Network(format!("receive failed: {}", e)))?;
            let mut datagram = BytesMut::from(&buf[..len]);
            match FrameCodec::new().decode(&mut datagram) {
                Ok(Some(frame)) => {
                    return Ok((NodeAddr::new("", &src.ip().to_string()), frame));
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", src, e);
                    continue;
                }
            }
        }
    }
}
