use serde::{Deserialize, Serialize};

/// A Class of Service: a named bundle of minimum resource requirements a
/// host must be able to commit before it may execute a payload of this
/// class.
///
/// The catalogue is provided by the orchestrator at startup and indexed by
/// `id`; instances are immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoS {
    pub id: u32,
    pub name: String,
    /// Minimum number of CPUs.
    pub min_cpu: f64,
    /// Minimum free RAM, in MB.
    pub min_ram: f64,
    /// Minimum free disk, in GB.
    pub min_disk: f64,
    /// Upper bound on the acceptable response time, in seconds.
    pub max_response_time: f64,
}

impl CoS {
    /// The default best-effort class, id 1.
    pub fn best_effort() -> CoS {
        CoS {
            id: 1,
            name: "best-effort".to_string(),
            min_cpu: 0.0,
            min_ram: 0.0,
            min_disk: 0.0,
            max_response_time: f64::MAX,
        }
    }
}
