use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::domain::{Reservation, ReservationState};
use crate::engine::EngineInner;
use crate::net::NodeAddr;
use crate::protocol::frame::{Frame, State};
use crate::protocol::registry::{ReservationEntry, ReservationKey};

/// Placeholder source address of nodes that have not joined yet.
const DEFAULT_IP: &str = "0.0.0.0";

/// What the dispatcher decided to do with a frame, computed under the
/// entry lock and executed after it is released.
enum Reaction {
    Ignore,
    ReplyReserveCancel,
    StartReservationResponder,
    ReplyCachedResult(Bytes),
    ReplyWait,
    ReplyDataCancel,
    StartExecution,
}

/// Inbound-frame reactor: drives the provider-side reservation machine and
/// handles frames that arrive for consumer requests after their waiters are
/// gone.
pub(crate) struct Responder {
    inner: Arc<EngineInner>,
}

impl Responder {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> JoinHandle<()> {
        tokio::spawn(async move { Responder { inner }.run().await })
    }

    async fn run(self) {
        loop {
            match self.inner.wire.recv().await {
                Ok((src, frame)) => {
                    if !self.wants(&src, &frame) {
                        continue;
                    }
                    // Waiters first; whatever they do not consume is ours.
                    let Some((src, frame)) = self.inner.pending.deliver(src, frame) else {
                        continue;
                    };
                    self.dispatch(src, frame).await;
                }
                Err(e) => {
                    warn!("Listener stopping: {}", e);
                    break;
                }
            }
        }
    }

    /// Frames from this node, from nowhere, or without an id are not for
    /// the protocol.
    fn wants(&self, src: &NodeAddr, frame: &Frame) -> bool {
        src.ip != self.inner.settings.node_ip && src.ip != DEFAULT_IP && !frame.req_id.is_empty()
    }

    async fn dispatch(&self, src: NodeAddr, frame: Frame) {
        if self.inner.settings.proto_verbose {
            debug!("recv {} from {}", frame, src.ip);
        }
        let from_orch = src.ip == self.inner.settings.orch_ip;
        match frame.state {
            State::ReserveRequest if from_orch && self.inner.settings.is_resource => {
                self.on_reserve_request(frame).await;
            }
            State::DataRequest => self.on_data_request(src, frame).await,
            State::DataResponse => self.on_data_response(src, frame).await,
            State::DataAck if from_orch => self.on_data_ack(frame).await,
            State::DataCancel if from_orch => self.on_data_cancel(frame).await,
            _ => {
                debug!("No handler for {} from {}, dropping", frame, src.ip);
            }
        }
    }

    /// The orchestrator asks this node to commit resources for a consumer
    /// request.
    async fn on_reserve_request(&self, frame: Frame) {
        let consumer_ip = frame.src_ip.clone();
        if consumer_ip.is_empty() {
            return;
        }
        let Some(cos) = self.inner.cos_by_id(frame.cos_id) else {
            debug!("Reserve request for unknown CoS {}, dropping", frame.cos_id);
            return;
        };
        let key: ReservationKey = (consumer_ip.clone(), frame.req_id.clone());
        let entry = self
            .inner
            .registry
            .reservation_or_insert(key.clone(), || Reservation::new(cos, frame.src_mac.clone()));

        let reaction = {
            let mut reservation = entry.lock();
            match reservation.state {
                // A request that was never reserved, or whose reservation
                // was cancelled, may (re)try to commit resources.
                ReservationState::ReserveRequested | ReservationState::ReserveCancelled => {
                    info!("Recv resource reservation request from orchestrator");
                    info!("Reserving resources");
                    if self.inner.accountant.reserve(&reservation.cos) {
                        reservation.mark_reserved();
                        Reaction::StartReservationResponder
                    } else {
                        // Resources became insufficient between the host
                        // request and now.
                        reservation.state = ReservationState::ReserveRequested;
                        Reaction::ReplyReserveCancel
                    }
                }
                _ => Reaction::Ignore,
            }
        };

        match reaction {
            Reaction::StartReservationResponder => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(respond_reservation(inner, entry, frame));
            }
            Reaction::ReplyReserveCancel => {
                info!("Resources are not sufficient (would exceed limit)");
                info!("Send resource reservation cancellation to orchestrator");
                let cancel = Frame::reserve_cancel(
                    &frame.req_id,
                    frame.attempt_no,
                    &frame.src_mac,
                    &frame.src_ip,
                );
                self.inner.send(&self.inner.orch_addr(), cancel).await;
            }
            _ => {}
        }
    }

    /// A consumer ships its payload; react according to how far the
    /// reservation got.
    async fn on_data_request(&self, src: NodeAddr, frame: Frame) {
        let key: ReservationKey = (src.ip.clone(), frame.req_id.clone());
        let Some(entry) = self.inner.registry.reservation(&key) else {
            return;
        };
        // Arms the reservation responder waiting for exactly this frame.
        entry.notify();

        let reaction = {
            let mut reservation = entry.lock();
            match reservation.state {
                ReservationState::Executed => {
                    Reaction::ReplyCachedResult(reservation.result.clone().unwrap_or_default())
                }
                ReservationState::Executing if reservation.worker.is_some() => Reaction::ReplyWait,
                ReservationState::Executing => Reaction::Ignore,
                ReservationState::ReserveCancelled => {
                    info!("Recv data exchange request from {}", src.ip);
                    if self.inner.accountant.reserve(&reservation.cos) {
                        info!("This request arrived late, but resources are still available");
                        info!("Reserving resources");
                        reservation.mark_reserved();
                        reservation.state = ReservationState::Executing;
                        Reaction::StartExecution
                    } else {
                        info!("This request arrived late, and resources are no longer sufficient (would exceed limit)");
                        reservation.state = ReservationState::DataCancelled;
                        Reaction::ReplyDataCancel
                    }
                }
                ReservationState::Reserved => {
                    info!("Recv data exchange request from {}", src.ip);
                    reservation.state = ReservationState::Executing;
                    Reaction::StartExecution
                }
                _ => Reaction::Ignore,
            }
        };

        match reaction {
            Reaction::ReplyCachedResult(result) => {
                info!("Send cached data exchange response to {}", src.ip);
                let reply = Frame::data_response(&frame.req_id, frame.attempt_no, result);
                self.inner.send(&src, reply).await;
            }
            Reaction::ReplyWait => {
                let reply = Frame::data_wait(&frame.req_id, frame.attempt_no);
                self.inner.send(&src, reply).await;
            }
            Reaction::ReplyDataCancel => {
                info!("Send data exchange cancellation to {}", src.ip);
                let me = self.inner.my_addr();
                let cancel = Frame::data_cancel(&frame.req_id, frame.attempt_no, &me.mac, &me.ip)
                    .with_src(&src.mac, &src.ip);
                self.inner.send(&src, cancel).await;
            }
            Reaction::StartExecution => {
                let inner = Arc::clone(&self.inner);
                let worker = tokio::spawn(respond_data(
                    inner,
                    Arc::clone(&entry),
                    src.clone(),
                    frame.req_id.clone(),
                    frame.attempt_no,
                    frame.data.clone(),
                ));
                entry.lock().worker = Some(worker);
            }
            _ => {}
        }
    }

    /// A data response arrived outside any send-and-wait window: either the
    /// consumer loop has moved on, or this is a duplicate.
    async fn on_data_response(&self, src: NodeAddr, frame: Frame) {
        let Some(entry) = self.inner.registry.request(&frame.req_id) else {
            return;
        };

        enum Outcome {
            Accepted,
            DuplicateSameHost,
            DuplicateOtherHost,
        }
        let outcome = {
            let mut request = entry.lock();
            if request.try_accept(frame.attempt_no, &src.ip, frame.data.clone()) {
                Outcome::Accepted
            } else if request.host.as_deref() == Some(src.ip.as_str()) {
                Outcome::DuplicateSameHost
            } else {
                Outcome::DuplicateOtherHost
            }
        };
        entry.notify();

        let orch = self.inner.orch_addr();
        match outcome {
            Outcome::Accepted => {
                info!("Recv data exchange response from {}", src.ip);
                info!("Send data exchange acknowledgement to orchestrator");
                let ack = Frame::data_ack(&frame.req_id, frame.attempt_no, &src.mac, &src.ip);
                self.inner.send(&orch, ack).await;
                self.inner.persist(&entry);
            }
            Outcome::DuplicateSameHost => {
                info!("Recv late data exchange response from {}, but result already received", src.ip);
                info!("Send data exchange acknowledgement to orchestrator");
                let ack = Frame::data_ack(&frame.req_id, frame.attempt_no, &src.mac, &src.ip);
                self.inner.send(&orch, ack).await;
            }
            Outcome::DuplicateOtherHost => {
                info!("Recv late data exchange response from {}, but result already received", src.ip);
                info!("Send data exchange cancellation to orchestrator");
                let cancel = Frame::data_cancel(&frame.req_id, frame.attempt_no, &src.mac, &src.ip);
                self.inner.send(&orch, cancel).await;
            }
        }
    }

    /// The orchestrator confirms the consumer accepted this node's result.
    async fn on_data_ack(&self, frame: Frame) {
        let key: ReservationKey = (frame.src_ip.clone(), frame.req_id.clone());
        let Some(entry) = self.inner.registry.reservation(&key) else {
            return;
        };
        let acted = {
            let mut reservation = entry.lock();
            if reservation.state == ReservationState::Executed {
                info!("Recv data exchange acknowledgement from orchestrator");
                reservation.free_once(&self.inner.accountant);
                true
            } else {
                false
            }
        };
        entry.notify();
        if acted {
            self.schedule_removal(key);
        }
    }

    /// The orchestrator rejected this node's result.
    async fn on_data_cancel(&self, frame: Frame) {
        let key: ReservationKey = (frame.src_ip.clone(), frame.req_id.clone());
        let Some(entry) = self.inner.registry.reservation(&key) else {
            return;
        };
        let acted = {
            let mut reservation = entry.lock();
            if reservation.state == ReservationState::Executed {
                info!("Recv data exchange cancellation from orchestrator");
                reservation.free_once(&self.inner.accountant);
                reservation.state = ReservationState::DataCancelled;
                true
            } else {
                false
            }
        };
        entry.notify();
        if acted {
            self.schedule_removal(key);
        }
    }

    /// Terminal reservations linger for a grace delay so late duplicates
    /// still find their state, then disappear.
    fn schedule_removal(&self, key: ReservationKey) {
        let inner = Arc::clone(&self.inner);
        let grace = inner.settings.host_wait();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inner.registry.remove_reservation(&key);
        });
    }
}

/// Confirms the reservation to the orchestrator and bounds how long it may
/// sit idle before the payload arrives.
async fn respond_reservation(inner: Arc<EngineInner>, entry: Arc<ReservationEntry>, rreq: Frame) {
    let response =
        Frame::reserve_response(&rreq.req_id, rreq.attempt_no, &rreq.src_mac, &rreq.src_ip);
    let orch = inner.orch_addr();
    let timeout = inner.settings.proto_timeout;

    let mut reply = None;
    let mut retries = inner.settings.proto_retries;
    while reply.is_none() && retries > 0 && entry.lock().state == ReservationState::Reserved {
        info!("Send resource reservation response to orchestrator");
        retries -= 1;
        reply = inner.exchange(&orch, response.clone(), timeout).await;
    }

    match reply {
        Some((_, frame)) if frame.state == State::ReserveCancel => {
            info!("Recv resource reservation cancellation from orchestrator");
            let mut reservation = entry.lock();
            if reservation.state == ReservationState::Reserved {
                reservation.state = ReservationState::ReserveCancelled;
                info!("Freeing resources");
                reservation.free_once(&inner.accountant);
            }
        }
        Some(_) => {
            info!("Recv resource reservation acknowledgement from orchestrator");
            if !entry.wait(inner.settings.host_wait()).await {
                info!("Waiting for data exchange request timed out");
                cancel_idle_reservation(&inner, &entry, &rreq).await;
            }
            // Otherwise the data exchange request arrived; the execution
            // responder owns the reservation from here.
        }
        None => {
            info!("Waiting for resource reservation acknowledgement timed out");
            cancel_idle_reservation(&inner, &entry, &rreq).await;
        }
    }
}

/// Cancels a reservation that is still idle in the reserved state, frees
/// its resources and tells the orchestrator.
async fn cancel_idle_reservation(inner: &EngineInner, entry: &ReservationEntry, rreq: &Frame) {
    let cancelled = {
        let mut reservation = entry.lock();
        if reservation.state == ReservationState::Reserved {
            reservation.state = ReservationState::ReserveCancelled;
            info!("Freeing resources");
            reservation.free_once(&inner.accountant);
            true
        } else {
            false
        }
    };
    if cancelled {
        info!("Send resource reservation cancellation to orchestrator");
        let cancel =
            Frame::reserve_cancel(&rreq.req_id, rreq.attempt_no, &rreq.src_mac, &rreq.src_ip);
        inner.send(&inner.orch_addr(), cancel).await;
    }
}

/// Executes the payload, then delivers the result until the consumer's
/// acknowledgement comes back through the orchestrator.
async fn respond_data(
    inner: Arc<EngineInner>,
    entry: Arc<ReservationEntry>,
    consumer: NodeAddr,
    req_id: String,
    attempt_no: u32,
    payload: Bytes,
) {
    info!("Executing");
    let result = match inner.executor.execute(&payload).await {
        Ok(result) => result,
        Err(e) => {
            // An executor failure still completes the exchange, with an
            // empty result.
            warn!("Execution failed, delivering empty result: {}", e);
            Bytes::new()
        }
    };
    {
        let mut reservation = entry.lock();
        reservation.result = Some(result.clone());
        reservation.state = ReservationState::Executed;
        reservation.worker = None;
    }

    let response = Frame::data_response(&req_id, attempt_no, result);
    let mut retries = inner.settings.proto_retries;
    while retries > 0 {
        info!("Send data exchange response to {}", consumer.ip);
        retries -= 1;
        inner.send(&consumer, response.clone()).await;
        if entry.wait(inner.settings.proto_timeout).await {
            if entry.lock().freed {
                return;
            }
            // Woken by a duplicate data request, not by an ack; keep
            // delivering within the budget.
        }
    }
    info!("Waiting for data exchange acknowledgement timed out");
    let mut reservation = entry.lock();
    if !reservation.freed {
        info!("Freeing resources");
        reservation.free_once(&inner.accountant);
    }
}
