use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::oneshot;

use crate::domain::{Request, Reservation};
use crate::protocol::frame::REQ_ID_LEN;

/// Provider-side reservations are keyed by the consumer's IP and the
/// request id, both as relayed by the orchestrator.
pub type ReservationKey = (String, String);

/// Generates a request id: random printable bytes, unique per consumer for
/// all practical purposes.
pub fn gen_req_id() -> String {
    let mut rng = rand::rng();
    (0..REQ_ID_LEN).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// One-shot wake-up slot.
///
/// `wait` installs a fresh waiter, replacing any previous one; `notify`
/// fires the installed waiter at most once. A notification with nobody
/// installed is lost, so a stale event can never wake a later phase of the
/// same key.
#[derive(Default)]
struct Wake {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl Wake {
    fn notify(&self) {
        if let Some(tx) = self.slot.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    async fn wait(&self, wait: Duration) -> bool {
        let rx = {
            let (tx, rx) = oneshot::channel();
            *self.slot.lock().unwrap() = Some(tx);
            rx
        };
        matches!(tokio::time::timeout(wait, rx).await, Ok(Ok(())))
    }
}

/// An in-flight consumer request plus its one-shot wake-up.
pub struct RequestEntry {
    state: Mutex<Request>,
    wake: Wake,
}

impl RequestEntry {
    fn new(request: Request) -> RequestEntry {
        RequestEntry { state: Mutex::new(request), wake: Wake::default() }
    }

    pub fn lock(&self) -> MutexGuard<'_, Request> {
        self.state.lock().unwrap()
    }

    /// Wakes whoever is currently blocked on this request, if anyone.
    pub fn notify(&self) {
        self.wake.notify();
    }

    /// Blocks until notified or until `wait` elapses. Returns true when the
    /// wake-up fired.
    pub async fn wait(&self, wait: Duration) -> bool {
        self.wake.wait(wait).await
    }

    /// Whether a result has been accepted; set at most once, never unset.
    pub fn has_result(&self) -> bool {
        self.lock().dres_at.is_some()
    }

    pub fn result(&self) -> Option<Bytes> {
        self.lock().result.clone()
    }
}

/// An in-flight provider reservation plus its one-shot wake-up.
pub struct ReservationEntry {
    state: Mutex<Reservation>,
    wake: Wake,
}

impl ReservationEntry {
    fn new(reservation: Reservation) -> ReservationEntry {
        ReservationEntry { state: Mutex::new(reservation), wake: Wake::default() }
    }

    pub fn lock(&self) -> MutexGuard<'_, Reservation> {
        self.state.lock().unwrap()
    }

    pub fn notify(&self) {
        self.wake.notify();
    }

    pub async fn wait(&self, wait: Duration) -> bool {
        self.wake.wait(wait).await
    }
}

/// The two keyed tables of in-flight protocol state.
///
/// The outer maps only guard membership; each entry serializes its own
/// mutations, so operations on different keys never contend.
#[derive(Default)]
pub struct Registry {
    requests: Mutex<HashMap<String, Arc<RequestEntry>>>,
    reservations: Mutex<HashMap<ReservationKey, Arc<ReservationEntry>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn insert_request(&self, request: Request) -> Arc<RequestEntry> {
        let id = request.id.clone();
        let entry = Arc::new(RequestEntry::new(request));
        self.requests.lock().unwrap().insert(id, Arc::clone(&entry));
        entry
    }

    pub fn request(&self, id: &str) -> Option<Arc<RequestEntry>> {
        self.requests.lock().unwrap().get(id).cloned()
    }

    pub fn reservation(&self, key: &ReservationKey) -> Option<Arc<ReservationEntry>> {
        self.reservations.lock().unwrap().get(key).cloned()
    }

    /// Returns the reservation under `key`, creating it with `make` when
    /// this is the first frame for the key.
    pub fn reservation_or_insert(
        &self,
        key: ReservationKey,
        make: impl FnOnce() -> Reservation,
    ) -> Arc<ReservationEntry> {
        let mut reservations = self.reservations.lock().unwrap();
        Arc::clone(
            reservations
                .entry(key)
                .or_insert_with(|| Arc::new(ReservationEntry::new(make()))),
        )
    }

    pub fn remove_reservation(&self, key: &ReservationKey) {
        self.reservations.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CoS, ReservationState};

    fn request(id: &str) -> Request {
        Request::new(id.to_string(), Arc::new(CoS::best_effort()), Bytes::new())
    }

    #[test]
    fn generated_ids_have_wire_width() {
        let id = gen_req_id();
        assert_eq!(id.len(), REQ_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(gen_req_id(), gen_req_id());
    }

    #[test]
    fn entries_are_shared_not_copied() {
        let registry = Registry::new();
        let entry = registry.insert_request(request("req0000001"));
        entry.lock().late = true;
        assert!(registry.request("req0000001").unwrap().lock().late);
        assert!(registry.request("other").is_none());
    }

    #[test]
    fn reservation_created_once_per_key() {
        let registry = Registry::new();
        let key = ("10.0.0.1".to_string(), "req0000001".to_string());
        let first = registry.reservation_or_insert(key.clone(), || {
            Reservation::new(Arc::new(CoS::best_effort()), "mac".into())
        });
        first.lock().state = ReservationState::Reserved;

        let second = registry.reservation_or_insert(key.clone(), || {
            panic!("existing entry must be reused");
        });
        assert_eq!(second.lock().state, ReservationState::Reserved);

        registry.remove_reservation(&key);
        assert!(registry.reservation(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_reaches_only_an_installed_waiter() {
        let registry = Registry::new();
        let entry = registry.insert_request(request("req0000001"));

        // Nobody is waiting yet, so this notification is lost.
        entry.notify();
        assert!(!entry.wait(Duration::from_secs(1)).await);

        // An installed waiter is woken.
        let (woken, ()) = tokio::join!(entry.wait(Duration::from_secs(5)), async {
            entry.notify();
        });
        assert!(woken);
    }
}
