use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use rand::Rng;

use crate::error::Result;

/// Executes a payload and produces a result.
///
/// Real workload execution (and any per-class traffic shaping around it)
/// lives behind this seam; the protocol engine only ships bytes in and out.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, payload: &Bytes) -> Result<Bytes>;
}

/// Simulated executor: sleeps for a random interval within the configured
/// bounds and returns a fixed result.
pub struct SimExecutor {
    min: Duration,
    max: Duration,
}

impl SimExecutor {
    pub fn new(min_secs: f64, max_secs: f64) -> SimExecutor {
        SimExecutor {
            min: Duration::from_secs_f64(min_secs),
            max: Duration::from_secs_f64(max_secs),
        }
    }
}

#[async_trait]
impl Executor for SimExecutor {
    async fn execute(&self, payload: &Bytes) -> Result<Bytes> {
        let wait = if self.max > self.min {
            let span = (self.max - self.min).as_secs_f64();
            self.min + Duration::from_secs_f64(rand::rng().random_range(0.0..span))
        } else {
            self.min
        };
        info!("Executing {} bytes for {:.2}s", payload.len(), wait.as_secs_f64());
        tokio::time::sleep(wait).await;
        Ok(Bytes::from_static(b"result"))
    }
}
