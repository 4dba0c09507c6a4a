use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::domain::cos::CoS;
use crate::resources::Accountant;

/// Lifecycle state of a provider-side reservation.
///
/// Transitions advance monotonically through the reservation and data
/// phases; the only backward edges are an explicit cancellation
/// (`Reserved -> ReserveCancelled`) and a late data request that manages to
/// re-reserve (`ReserveCancelled -> Reserved`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// A reservation request arrived but resources are not committed yet.
    ReserveRequested,
    /// Resources are committed; waiting for the data exchange to start.
    Reserved,
    /// The payload arrived and a worker is executing it.
    Executing,
    /// Execution finished; the result is cached for (re)delivery.
    Executed,
    /// The reservation was cancelled and resources released.
    ReserveCancelled,
    /// The data exchange was cancelled by the orchestrator.
    DataCancelled,
}

impl ReservationState {
    /// Whether moving from `self` to `next` follows the reservation
    /// lifecycle. Exhaustive on purpose, so a new state cannot be added
    /// without revisiting every edge.
    pub fn can_transition(self, next: ReservationState) -> bool {
        use ReservationState::*;
        match (self, next) {
            (ReserveRequested, Reserved) => true,
            (Reserved, Executing) => true,
            (Reserved, ReserveCancelled) => true,
            (ReserveCancelled, Reserved) => true,
            (Executing, Executed) => true,
            (Executed, DataCancelled) => true,
            (ReserveRequested, _) => false,
            (Reserved, _) => false,
            (Executing, _) => false,
            (Executed, _) => false,
            (ReserveCancelled, _) => false,
            (DataCancelled, _) => false,
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReservationState::ReserveRequested => "RREQ",
            ReservationState::Reserved => "RRES",
            ReservationState::Executing => "DREQ",
            ReservationState::Executed => "DRES",
            ReservationState::ReserveCancelled => "RCAN",
            ReservationState::DataCancelled => "DCAN",
        };
        write!(f, "{}", name)
    }
}

/// A provider-side reservation: the commitment of a fraction of local
/// capacity to one consumer request, keyed by `(consumer_ip, request_id)`.
///
/// `freed` is true exactly when no reserved quantities are outstanding for
/// this key; [`Reservation::free_once`] keeps releasing idempotent no matter
/// how many protocol paths attempt it.
#[derive(Debug)]
pub struct Reservation {
    pub cos: Arc<CoS>,
    pub state: ReservationState,
    pub result: Option<Bytes>,
    pub freed: bool,
    /// Handle of the execution worker, while one is running.
    pub worker: Option<JoinHandle<()>>,
    /// MAC of the consumer, as relayed by the orchestrator.
    pub consumer_mac: String,
}

impl Reservation {
    pub fn new(cos: Arc<CoS>, consumer_mac: String) -> Reservation {
        Reservation {
            cos,
            state: ReservationState::ReserveRequested,
            result: None,
            freed: true,
            worker: None,
            consumer_mac,
        }
    }

    /// Records a successful commitment of resources.
    pub fn mark_reserved(&mut self) {
        debug_assert!(self.state.can_transition(ReservationState::Reserved));
        self.state = ReservationState::Reserved;
        self.freed = false;
    }

    /// Returns the reserved quantities to the accountant, at most once per
    /// commitment. Safe to call from any number of protocol paths.
    pub fn free_once(&mut self, accountant: &Accountant) {
        if !self.freed {
            accountant.free(&self.cos);
            self.freed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use ReservationState::*;
        assert!(ReserveRequested.can_transition(Reserved));
        assert!(Reserved.can_transition(Executing));
        assert!(Reserved.can_transition(ReserveCancelled));
        assert!(ReserveCancelled.can_transition(Reserved));
        assert!(Executing.can_transition(Executed));
        assert!(!Executed.can_transition(Reserved));
        assert!(!DataCancelled.can_transition(Reserved));
        assert!(!ReserveRequested.can_transition(Executing));
    }
}
