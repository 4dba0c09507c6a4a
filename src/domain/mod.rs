pub mod cos;
pub mod request;
pub mod reservation;

pub use cos::CoS;
pub use request::{Attempt, AttemptState, Request, RequestState};
pub use reservation::{Reservation, ReservationState};
