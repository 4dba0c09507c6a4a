use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::net::{NodeAddr, Wire};
use crate::protocol::{Frame, FrameCodec, State};
use tokio_util::codec::{Decoder, Encoder};

/// A record of one frame the hub routed (or refused to route).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub state: State,
    pub req_id: String,
    pub dropped: bool,
}

struct DropRule {
    state: State,
    to_ip: Option<String>,
    remaining: usize,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, mpsc::UnboundedSender<(NodeAddr, BytesMut)>>,
    drops: Vec<DropRule>,
    journal: Vec<Delivery>,
}

/// In-process switch connecting any number of engines by IP.
///
/// Frames cross the hub in encoded form, so the codec is exercised on every
/// hop. The hub keeps a journal of routed frames and supports targeted
/// frame-loss injection, which is how lossy-network behaviour is simulated.
#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Arc<Hub> {
        Arc::new(Hub::default())
    }

    /// Plugs a node into the hub and returns its wire.
    pub fn attach(self: &Arc<Self>, mac: &str, ip: &str) -> MemoryWire {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().peers.insert(ip.to_string(), tx);
        MemoryWire {
            hub: Arc::clone(self),
            addr: NodeAddr::new(mac, ip),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Silently discards the next `count` frames of the given state headed
    /// for `to_ip` (any destination when `None`).
    pub fn drop_frames(&self, state: State, to_ip: Option<&str>, count: usize) {
        self.inner.lock().unwrap().drops.push(DropRule {
            state,
            to_ip: to_ip.map(str::to_string),
            remaining: count,
        });
    }

    /// Snapshot of everything routed so far.
    pub fn journal(&self) -> Vec<Delivery> {
        self.inner.lock().unwrap().journal.clone()
    }

    /// Number of frames of `state` actually delivered to `to_ip` (any
    /// destination when `None`).
    pub fn delivered(&self, state: State, to_ip: Option<&str>) -> usize {
        self.inner
            .lock()
            .unwrap()
            .journal
            .iter()
            .filter(|d| !d.dropped && d.state == state && to_ip.is_none_or(|ip| d.to == ip))
            .count()
    }

    fn route(&self, from: &NodeAddr, dst_ip: &str, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();

        let mut dropped = false;
        for rule in inner.drops.iter_mut() {
            let target_matches = rule.to_ip.as_deref().is_none_or(|ip| ip == dst_ip);
            if rule.remaining > 0 && rule.state == frame.state && target_matches {
                rule.remaining -= 1;
                dropped = true;
                break;
            }
        }

        if !dropped && !inner.peers.contains_key(dst_ip) {
            debug!("Hub has no peer at {}, discarding {}", dst_ip, frame);
            dropped = true;
        }
        inner.journal.push(Delivery {
            from: from.ip.clone(),
            to: dst_ip.to_string(),
            state: frame.state,
            req_id: frame.req_id.clone(),
            dropped,
        });
        if dropped {
            return;
        }

        let tx = &inner.peers[dst_ip];
        let mut buf = BytesMut::new();
        if FrameCodec::new().encode(frame, &mut buf).is_ok() {
            let _ = tx.send((from.clone(), buf));
        }
    }
}

/// One node's endpoint on a [`Hub`].
pub struct MemoryWire {
    hub: Arc<Hub>,
    addr: NodeAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(NodeAddr, BytesMut)>>,
}

#[async_trait]
impl Wire for MemoryWire {
    async fn send(&self, dst: &NodeAddr, frame: Frame) -> Result<()> {
        self.hub.route(&self.addr, &dst.ip, frame);
        Ok(())
    }

    async fn recv(&self) -> Result<(NodeAddr, Frame)> {
        let mut rx = self.rx.lock().await;
        loop {
            let (src, mut datagram) = rx
                .recv()
                .await
                .ok_or_else(|| Error::Network("wire detached from hub".into()))?;
            match FrameCodec::new().decode(&mut datagram) {
                Ok(Some(frame)) => return Ok((src, frame)),
                Ok(None) => continue,
                Err(e) => {
                    debug!("Dropping malformed frame from {}: {}", src.ip, e);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn routes_between_peers() {
        let hub = Hub::new();
        let a = hub.attach("02:00:00:00:00:01", "10.0.0.1");
        let b = hub.attach("02:00:00:00:00:02", "10.0.0.2");

        a.send(&NodeAddr::new("", "10.0.0.2"), Frame::data_request("req0000001", 1, Bytes::from_static(b"x")))
            .await
            .unwrap();
        let (src, frame) = b.recv().await.unwrap();
        assert_eq!(src.ip, "10.0.0.1");
        assert_eq!(frame.state, State::DataRequest);
        assert_eq!(hub.delivered(State::DataRequest, Some("10.0.0.2")), 1);
    }

    #[tokio::test]
    async fn drop_rules_consume_matching_frames() {
        let hub = Hub::new();
        let a = hub.attach("02:00:00:00:00:01", "10.0.0.1");
        let b = hub.attach("02:00:00:00:00:02", "10.0.0.2");
        hub.drop_frames(State::DataRequest, Some("10.0.0.2"), 1);

        let dst = NodeAddr::new("", "10.0.0.2");
        a.send(&dst, Frame::data_request("req0000001", 1, Bytes::new())).await.unwrap();
        a.send(&dst, Frame::data_request("req0000001", 2, Bytes::new())).await.unwrap();

        let (_, frame) = b.recv().await.unwrap();
        assert_eq!(frame.attempt_no, 2);
        assert_eq!(hub.delivered(State::DataRequest, Some("10.0.0.2")), 1);
        assert_eq!(hub.journal().iter().filter(|d| d.dropped).count(), 1);
    }
}
