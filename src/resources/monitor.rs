use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

/// One sample of the node's real resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measures {
    pub cpu_count: f64,
    pub cpu_free: f64,
    /// In MB.
    pub memory_total: f64,
    pub memory_free: f64,
    /// In GB.
    pub disk_total: f64,
    pub disk_free: f64,
}

/// Where samples come from. Live probing of the operating system lives
/// behind this seam; the engine itself never touches it.
pub trait MeasureSource: Send + Sync {
    fn sample(&self) -> Measures;
}

/// A source that always reports the same values. Stands in for live
/// probing in simulations and tests.
pub struct StaticSource(pub Measures);

impl MeasureSource for StaticSource {
    fn sample(&self) -> Measures {
        self.0
    }
}

/// Periodic sampler of a [`MeasureSource`].
///
/// The latest sample sits behind a read lock so the accountant can read it
/// from inside its critical section without blocking.
pub struct Monitor {
    measures: Arc<RwLock<Measures>>,
    worker: JoinHandle<()>,
}

impl Monitor {
    /// Takes one synchronous sample to seed the shared state, then keeps
    /// sampling every `period` until stopped.
    pub fn start(source: Arc<dyn MeasureSource>, period: Duration) -> Monitor {
        let measures = Arc::new(RwLock::new(source.sample()));
        let shared = Arc::clone(&measures);
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = source.sample();
                debug!(
                    "monitor sample: cpu_free={:.2} memory_free={:.2}MB disk_free={:.2}GB",
                    sample.cpu_free, sample.memory_free, sample.disk_free
                );
                *shared.write().unwrap() = sample;
            }
        });
        Monitor { measures, worker }
    }

    /// Shared handle to the latest sample.
    pub fn measures(&self) -> Arc<RwLock<Measures>> {
        Arc::clone(&self.measures)
    }

    pub fn stop(&self) {
        self.worker.abort();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}
