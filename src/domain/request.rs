use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::domain::cos::CoS;

/// Lifecycle state of a consumer-side request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the orchestrator to name a host.
    HostRequested,
    /// A host was named; the data exchange is in progress.
    DataRequested,
    /// A result was accepted; the request is terminal and immutable.
    DataReceived,
    /// All retry budgets were exhausted without a result.
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::HostRequested => "HREQ",
            RequestState::DataRequested => "DREQ",
            RequestState::DataReceived => "DRES",
            RequestState::Failed => "FAIL",
        };
        write!(f, "{}", name)
    }
}

/// State of a single attempt toward the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    HostRequested,
    DataRequested,
    DataReceived,
    Cancelled,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::HostRequested => "HREQ",
            AttemptState::DataRequested => "DREQ",
            AttemptState::DataReceived => "DRES",
            AttemptState::Cancelled => "DCAN",
        };
        write!(f, "{}", name)
    }
}

/// One (re)issue of a request toward the orchestrator. A request may carry
/// several; they are stored by value inside the request, keyed by number.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt_no: u32,
    pub host: Option<String>,
    pub state: AttemptState,
    pub hreq_at: Option<DateTime<Utc>>,
    pub hres_at: Option<DateTime<Utc>>,
    pub rres_at: Option<DateTime<Utc>>,
    pub dres_at: Option<DateTime<Utc>>,
}

impl Attempt {
    fn new(attempt_no: u32) -> Attempt {
        Attempt {
            attempt_no,
            host: None,
            state: AttemptState::HostRequested,
            hreq_at: Some(Utc::now()),
            hres_at: None,
            rres_at: None,
            dres_at: None,
        }
    }
}

/// A consumer-side request: one payload of a given Class of Service looking
/// for a host to execute it.
///
/// Once `dres_at` is set the request is terminal: `state` is
/// [`RequestState::DataReceived`], `result` is populated, and neither changes
/// again. Frames received afterwards are late and must never mutate it.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub cos: Arc<CoS>,
    pub payload: Bytes,
    pub result: Option<Bytes>,
    /// IP of the provider whose result was (or is about to be) accepted.
    pub host: Option<String>,
    pub state: RequestState,
    pub hreq_at: Option<DateTime<Utc>>,
    pub dres_at: Option<DateTime<Utc>>,
    pub attempts: BTreeMap<u32, Attempt>,
    /// Set when the data-exchange budget ran dry; a response may still
    /// arrive late.
    pub late: bool,
}

impl Request {
    pub fn new(id: String, cos: Arc<CoS>, payload: Bytes) -> Request {
        Request {
            id,
            cos,
            payload,
            result: None,
            host: None,
            state: RequestState::HostRequested,
            hreq_at: None,
            dres_at: None,
            attempts: BTreeMap::new(),
            late: false,
        }
    }

    /// Opens a new attempt, stamps it, and resets the per-attempt fields of
    /// the request. Returns the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt_no = self.attempts.len() as u32 + 1;
        let attempt = Attempt::new(attempt_no);
        if self.hreq_at.is_none() {
            self.hreq_at = attempt.hreq_at;
        }
        self.host = None;
        self.state = RequestState::HostRequested;
        self.attempts.insert(attempt_no, attempt);
        attempt_no
    }

    /// Records the host named by the orchestrator for the given attempt.
    pub fn record_host(&mut self, attempt_no: u32, host: &str) {
        self.state = RequestState::DataRequested;
        self.host = Some(host.to_string());
        if let Some(attempt) = self.attempts.get_mut(&attempt_no) {
            attempt.state = AttemptState::DataRequested;
            attempt.host = Some(host.to_string());
            attempt.hres_at = Some(Utc::now());
        }
    }

    /// Accepts a result, if none was accepted before. Returns true when this
    /// call performed the acceptance; false when the request was already
    /// terminal (the caller must not acknowledge again).
    pub fn try_accept(&mut self, attempt_no: u32, host: &str, result: Bytes) -> bool {
        if self.dres_at.is_some() {
            return false;
        }
        let dres_at = Utc::now();
        self.dres_at = Some(dres_at);
        self.state = RequestState::DataReceived;
        self.host = Some(host.to_string());
        self.result = Some(result);
        if let Some(attempt) = self.attempts.get_mut(&attempt_no) {
            attempt.state = AttemptState::DataReceived;
            attempt.dres_at = Some(dres_at);
        }
        true
    }

    pub fn cancel_attempt(&mut self, attempt_no: u32) {
        if let Some(attempt) = self.attempts.get_mut(&attempt_no) {
            attempt.state = AttemptState::Cancelled;
        }
    }

    /// Marks the request failed unless a result slipped in late.
    pub fn finalize(&mut self) {
        if self.dres_at.is_none() {
            self.state = RequestState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new("ReqId00001".to_string(), Arc::new(CoS::best_effort()), Bytes::from_static(b"x"))
    }

    #[test]
    fn attempts_are_numbered_from_one() {
        let mut req = request();
        assert_eq!(req.begin_attempt(), 1);
        assert_eq!(req.begin_attempt(), 2);
        assert!(req.hreq_at.is_some());
        assert_eq!(req.attempts[&1].attempt_no, 1);
    }

    #[test]
    fn accept_is_first_writer_wins() {
        let mut req = request();
        req.begin_attempt();
        assert!(req.try_accept(1, "10.0.0.2", Bytes::from_static(b"r")));
        let first_stamp = req.dres_at;

        // A second response, even from another host, must not change anything.
        assert!(!req.try_accept(1, "10.0.0.3", Bytes::from_static(b"other")));
        assert_eq!(req.result.as_deref(), Some(b"r".as_ref()));
        assert_eq!(req.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(req.dres_at, first_stamp);
        assert_eq!(req.state, RequestState::DataReceived);
    }

    #[test]
    fn finalize_spares_late_results() {
        let mut req = request();
        req.begin_attempt();
        req.finalize();
        assert_eq!(req.state, RequestState::Failed);

        // Late acceptance flips the terminal state exactly once.
        assert!(req.try_accept(1, "10.0.0.2", Bytes::from_static(b"r")));
        req.finalize();
        assert_eq!(req.state, RequestState::DataReceived);
    }
}
