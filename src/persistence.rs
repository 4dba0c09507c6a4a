use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::Request;
use crate::error::Result;

/// Depth of the write queue; saves beyond it are dropped, never blocked on.
const QUEUE_DEPTH: usize = 64;

/// Flat snapshot of one attempt, one row per attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub request_id: String,
    pub attempt_no: u32,
    pub host: Option<String>,
    pub state: String,
    pub hreq_at: Option<DateTime<Utc>>,
    pub hres_at: Option<DateTime<Utc>>,
    pub rres_at: Option<DateTime<Utc>>,
    pub dres_at: Option<DateTime<Utc>>,
}

/// Flat snapshot of a request at a terminal transition.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub cos_id: u32,
    pub cos_name: String,
    pub state: String,
    pub host: Option<String>,
    pub result: Option<String>,
    pub hreq_at: Option<DateTime<Utc>>,
    pub dres_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub attempts: Vec<AttemptRecord>,
}

impl RequestRecord {
    pub fn snapshot(request: &Request) -> RequestRecord {
        RequestRecord {
            id: request.id.clone(),
            cos_id: request.cos.id,
            cos_name: request.cos.name.clone(),
            state: request.state.to_string(),
            host: request.host.clone(),
            result: request.result.as_ref().map(|r| String::from_utf8_lossy(r).into_owned()),
            hreq_at: request.hreq_at,
            dres_at: request.dres_at,
            attempts: request
                .attempts
                .values()
                .map(|attempt| AttemptRecord {
                    request_id: request.id.clone(),
                    attempt_no: attempt.attempt_no,
                    host: attempt.host.clone(),
                    state: attempt.state.to_string(),
                    hreq_at: attempt.hreq_at,
                    hres_at: attempt.hres_at,
                    rres_at: attempt.rres_at,
                    dres_at: attempt.dres_at,
                })
                .collect(),
        }
    }
}

/// Where terminal request snapshots end up.
pub trait Store: Send + Sync {
    fn save(&self, record: &RequestRecord) -> Result<()>;
}

/// CSV store: one file per entity, named after the node so several nodes
/// can share a directory.
pub struct CsvStore {
    requests: Mutex<csv::Writer<fs::File>>,
    attempts: Mutex<csv::Writer<fs::File>>,
}

impl CsvStore {
    pub fn open(dir: &Path, node_ip: &str) -> Result<CsvStore> {
        fs::create_dir_all(dir)?;
        let requests = csv::Writer::from_writer(fs::File::create(
            dir.join(format!("requests.{}.csv", node_ip)),
        )?);
        let attempts = csv::Writer::from_writer(fs::File::create(
            dir.join(format!("attempts.{}.csv", node_ip)),
        )?);
        Ok(CsvStore { requests: Mutex::new(requests), attempts: Mutex::new(attempts) })
    }
}

impl Store for CsvStore {
    fn save(&self, record: &RequestRecord) -> Result<()> {
        let mut requests = self.requests.lock().unwrap();
        requests.serialize(record).map_err(|e| std::io::Error::other(e))?;
        requests.flush()?;

        let mut attempts = self.attempts.lock().unwrap();
        for attempt in &record.attempts {
            attempts.serialize(attempt).map_err(|e| std::io::Error::other(e))?;
        }
        attempts.flush()?;
        Ok(())
    }
}

/// Keeps every snapshot in memory; the store used by tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<RequestRecord>>,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::default())
    }

    pub fn saved(&self) -> Vec<RequestRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Store for MemoryStore {
    fn save(&self, record: &RequestRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Background writer consuming a bounded queue of snapshots.
pub struct Persistence {
    tx: mpsc::Sender<RequestRecord>,
    worker: JoinHandle<()>,
}

impl Persistence {
    pub fn start(store: Arc<dyn Store>) -> Persistence {
        let (tx, mut rx) = mpsc::channel::<RequestRecord>(QUEUE_DEPTH);
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.save(&record) {
                    warn!("Failed to persist request {}: {}", record.id, e);
                }
            }
            info!("Persistence worker drained");
        });
        Persistence { tx, worker }
    }

    /// Best-effort enqueue; a full queue drops the snapshot with a warning.
    pub fn save(&self, record: RequestRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!("Dropping request snapshot: {}", e);
        }
    }

    /// Closes the queue and waits for pending writes to land.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CoS;
    use bytes::Bytes;

    #[tokio::test]
    async fn snapshots_reach_the_store() {
        let store = MemoryStore::new();
        let persistence = Persistence::start(store.clone());

        let mut request =
            Request::new("req0000001".into(), Arc::new(CoS::best_effort()), Bytes::from_static(b"x"));
        request.begin_attempt();
        request.try_accept(1, "10.0.0.2", Bytes::from_static(b"r"));
        persistence.save(RequestRecord::snapshot(&request));
        persistence.shutdown().await;

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].state, "DRES");
        assert_eq!(saved[0].result.as_deref(), Some("r"));
        assert_eq!(saved[0].attempts.len(), 1);
    }

    #[test]
    fn csv_store_writes_one_file_per_entity() {
        let dir = std::env::temp_dir().join(format!("fog_node_store_{}", std::process::id()));
        let store = CsvStore::open(&dir, "10.0.0.1").unwrap();

        let mut request =
            Request::new("req0000001".into(), Arc::new(CoS::best_effort()), Bytes::new());
        request.begin_attempt();
        request.finalize();
        store.save(&RequestRecord::snapshot(&request)).unwrap();

        let requests = fs::read_to_string(dir.join("requests.10.0.0.1.csv")).unwrap();
        assert!(requests.contains("req0000001"));
        assert!(requests.contains("FAIL"));
        let attempts = fs::read_to_string(dir.join("attempts.10.0.0.1.csv")).unwrap();
        assert!(attempts.contains("req0000001"));
        fs::remove_dir_all(&dir).ok();
    }
}
