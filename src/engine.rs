use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::domain::CoS;
use crate::error::Result;
use crate::net::{NodeAddr, Wire};
use crate::persistence::{Persistence, RequestRecord, Store};
use crate::protocol::registry::{Registry, RequestEntry};
use crate::protocol::responder::Responder;
use crate::protocol::{initiator, Frame, State};
use crate::resources::{Accountant, Executor, MeasureSource, Monitor};
use crate::settings::Settings;

struct PendingSlot {
    query: State,
    token: u64,
    tx: oneshot::Sender<(NodeAddr, Frame)>,
}

/// Send-and-wait slots, keyed by request id.
///
/// An inbound frame is consumed by at most one party: if it answers a
/// registered query it goes to that waiter, otherwise it falls through to
/// the responder state machines.
#[derive(Default)]
pub(crate) struct Pending {
    slots: Mutex<HashMap<String, PendingSlot>>,
    next_token: AtomicU64,
}

impl Pending {
    fn register(&self, req_id: &str, query: State) -> (oneshot::Receiver<(NodeAddr, Frame)>, u64) {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .unwrap()
            .insert(req_id.to_string(), PendingSlot { query, token, tx });
        (rx, token)
    }

    fn forget(&self, req_id: &str, token: u64) {
        let mut slots = self.slots.lock().unwrap();
        if slots.get(req_id).is_some_and(|slot| slot.token == token) {
            slots.remove(req_id);
        }
    }

    /// Hands the frame to a matching waiter. Returns the frame back when no
    /// waiter consumed it (none registered, wrong pairing, or the waiter
    /// timed out in the meantime).
    pub(crate) fn deliver(&self, src: NodeAddr, frame: Frame) -> Option<(NodeAddr, Frame)> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(&frame.req_id) {
                Some(slot) if frame.state.answers(slot.query) => slots.remove(&frame.req_id),
                _ => None,
            }
        };
        match slot {
            Some(slot) => slot.tx.send((src, frame)).err(),
            None => Some((src, frame)),
        }
    }
}

/// Shared state of one protocol engine: everything the initiator, the
/// responder and their spawned workers need.
pub(crate) struct EngineInner {
    pub(crate) settings: Settings,
    pub(crate) wire: Arc<dyn Wire>,
    pub(crate) registry: Registry,
    pub(crate) accountant: Accountant,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) persistence: Persistence,
    pub(crate) pending: Pending,
    cos: HashMap<u32, Arc<CoS>>,
}

impl EngineInner {
    pub(crate) fn my_addr(&self) -> NodeAddr {
        NodeAddr::new(&self.settings.node_mac, &self.settings.node_ip)
    }

    pub(crate) fn orch_addr(&self) -> NodeAddr {
        NodeAddr::new(&self.settings.orch_mac, &self.settings.orch_ip)
    }

    pub(crate) fn cos_by_id(&self, id: u32) -> Option<Arc<CoS>> {
        self.cos.get(&id).cloned()
    }

    /// Fire-and-forget send; a failure is logged and otherwise treated like
    /// a lost frame, which the retry discipline absorbs.
    pub(crate) async fn send(&self, dst: &NodeAddr, frame: Frame) {
        if self.settings.proto_verbose {
            debug!("send {} toward {}", frame, dst.ip);
        }
        if let Err(e) = self.wire.send(dst, frame).await {
            warn!("Send toward {} failed: {}", dst.ip, e);
        }
    }

    /// Sends `frame` and waits up to `wait` for a frame that answers it.
    pub(crate) async fn exchange(
        &self,
        dst: &NodeAddr,
        frame: Frame,
        wait: Duration,
    ) -> Option<(NodeAddr, Frame)> {
        let req_id = frame.req_id.clone();
        let (rx, token) = self.pending.register(&req_id, frame.state);
        self.send(dst, frame).await;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.pending.forget(&req_id, token);
                None
            }
        }
    }

    /// Snapshots the request and hands it to the persistence worker.
    pub(crate) fn persist(&self, entry: &RequestEntry) {
        let record = RequestRecord::snapshot(&entry.lock());
        self.persistence.save(record);
    }
}

/// One protocol engine: the per-node value owning the registries, the
/// accountant, the monitor, the listener and the persistence worker.
///
/// Engines are self-contained; several can run in one process, each on its
/// own wire.
pub struct Engine {
    inner: Arc<EngineInner>,
    listener: JoinHandle<()>,
    monitor: Monitor,
}

impl Engine {
    /// Brings the engine up: seeds the monitor, builds the accountant and
    /// starts the inbound listener.
    pub fn start(
        settings: Settings,
        catalogue: Vec<CoS>,
        wire: Arc<dyn Wire>,
        executor: Arc<dyn Executor>,
        store: Arc<dyn Store>,
        source: Arc<dyn MeasureSource>,
    ) -> Engine {
        let monitor = Monitor::start(source, settings.monitor_period);
        let accountant = Accountant::new(&settings, monitor.measures());
        let persistence = Persistence::start(store);
        let cos = catalogue
            .into_iter()
            .map(|cos| (cos.id, Arc::new(cos)))
            .collect();

        let inner = Arc::new(EngineInner {
            settings,
            wire,
            registry: Registry::new(),
            accountant,
            executor,
            persistence,
            pending: Pending::default(),
            cos,
        });
        let listener = Responder::spawn(Arc::clone(&inner));
        Engine { inner, listener, monitor }
    }

    /// Finds a host for a payload of the given class and exchanges data
    /// with it. Returns the result, or `None` when every retry budget ran
    /// dry without one.
    pub async fn send_request(&self, cos_id: u32, data: Bytes) -> Result<Option<Bytes>> {
        initiator::send_request(Arc::clone(&self.inner), cos_id, data).await
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn accountant(&self) -> &Accountant {
        &self.inner.accountant
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn cos_catalogue(&self) -> Vec<Arc<CoS>> {
        self.inner.cos.values().cloned().collect()
    }

    /// Logs the node's capacities and what is left for reservation.
    pub fn log_resources(&self) {
        let free = self.inner.accountant.current();
        let settings = &self.inner.settings;
        if settings.is_resource {
            log::info!(
                "Available for reservation: cpu={:.2}, ram={:.2}MB, disk={:.2}GB (usage limit {:.0}%)",
                free.cpu,
                free.ram,
                free.disk,
                settings.limit * 100.0
            );
        } else {
            log::info!("No resources to offer in this mode");
        }
    }

    /// Explicit teardown: stops the listener and the monitor and drains the
    /// persistence queue.
    pub async fn shutdown(self) {
        self.listener.abort();
        self.monitor.stop();
        let Engine { inner, .. } = self;
        // Workers hold clones of the inner state; the persistence queue is
        // shared with them and drains once the last clone is gone.
        if let Some(inner) = Arc::into_inner(inner) {
            inner.persistence.shutdown().await;
        }
    }
}
