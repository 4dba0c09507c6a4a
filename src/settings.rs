use std::collections::HashMap;
use std::env;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};

/// Runtime configuration of a node, resolved from the environment and the
/// parameter map received from the orchestrator at startup.
///
/// Parameters the node cannot run without (the orchestrator decoy addresses
/// and the node's own addresses) are fatal when missing; everything else
/// falls back to a default with a warning.
#[derive(Debug, Clone)]
pub struct Settings {
    /// This node's IPv4 address on the orchestrated network.
    pub node_ip: String,
    /// This node's MAC address on the orchestrated network.
    pub node_mac: String,

    /// Fixed IP at which the orchestrator is reachable.
    pub orch_ip: String,
    /// Fixed MAC at which the orchestrator is reachable.
    pub orch_mac: String,

    /// Unit wait for a single protocol reply.
    pub proto_timeout: Duration,
    /// Retry budget shared by all protocol loops.
    pub proto_retries: u32,
    /// Dump frames and per-request details at debug level.
    pub proto_verbose: bool,
    /// UDP port the protocol engine binds and sends to.
    pub proto_port: u16,

    /// Whether this node offers its resources to others.
    pub is_resource: bool,
    /// Whether capacities are simulated instead of measured.
    pub simulator_active: bool,
    /// Declared capacities when the simulator is active.
    pub host_cpu: f64,
    pub host_ram: f64,
    pub host_disk: f64,
    /// Fraction of each capacity that must stay free after a reservation.
    pub threshold: f64,
    /// Overall usage limit, reported in the startup summary.
    pub limit: f64,
    /// Sampling period of the resource monitor.
    pub monitor_period: Duration,

    /// Bounds of the simulated execution time.
    pub exec_min: f64,
    pub exec_max: f64,
}

impl Settings {
    /// Resolves settings from the process environment alone.
    pub fn from_env() -> Result<Settings> {
        Self::resolve(&HashMap::new())
    }

    /// Resolves settings from the process environment overlaid with the
    /// parameter map received from the orchestrator's `/config` endpoint.
    /// Orchestrator parameters win over the environment.
    pub fn resolve(params: &HashMap<String, String>) -> Result<Settings> {
        let get = |key: &str| -> Option<String> {
            params.get(key).cloned().or_else(|| env::var(key).ok())
        };

        let orch_mac = get("CONTROLLER_DECOY_MAC").ok_or_else(|| {
            Error::Config("CONTROLLER:DECOY_MAC parameter missing from received configuration".into())
        })?;
        let orch_ip = get("CONTROLLER_DECOY_IP").ok_or_else(|| {
            Error::Config("CONTROLLER:DECOY_IP parameter missing from received configuration".into())
        })?;
        let node_ip = get("NODE_IP")
            .ok_or_else(|| Error::Config("NODE_IP parameter missing".into()))?;
        let node_mac = get("NODE_MAC")
            .ok_or_else(|| Error::Config("NODE_MAC parameter missing".into()))?;

        let proto_timeout = Duration::from_secs_f64(parse_or(&get, "PROTO_TIMEOUT", 2.0));
        let proto_retries = parse_or(&get, "PROTO_RETRIES", 3u32).max(1);
        let proto_verbose = flag_or(&get, "PROTO_VERBOSE", false);
        let proto_port = parse_or(&get, "PROTO_PORT", 9750u16);

        let is_resource = flag_or(&get, "IS_RESOURCE", false);
        let simulator_active = flag_or(&get, "SIMULATOR_ACTIVE", false);

        let (host_cpu, host_ram, host_disk) = if is_resource && simulator_active {
            (
                require_num(&get, "HOST_CPU")?,
                require_num(&get, "HOST_RAM")?,
                require_num(&get, "HOST_DISK")?,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let threshold = parse_or(&get, "THRESHOLD", 0.1f64).clamp(0.0, 1.0);
        let limit = parse_or(&get, "LIMIT", 1.0f64).clamp(0.0, 1.0);
        let monitor_period = Duration::from_secs_f64(parse_or(&get, "MONITOR_PERIOD", 1.0));

        let mut exec_min = parse_or(&get, "SIMULATOR_EXEC_MIN", 0.0f64);
        let mut exec_max = parse_or(&get, "SIMULATOR_EXEC_MAX", 1.0f64);
        if exec_max < exec_min {
            warn!(
                "SIMULATOR:EXEC_MIN and SIMULATOR:EXEC_MAX parameters ({} and {}) invalid in received configuration. Defaulting to [0s, 1s]",
                exec_min, exec_max
            );
            exec_min = 0.0;
            exec_max = 1.0;
        }

        Ok(Settings {
            node_ip,
            node_mac,
            orch_ip,
            orch_mac,
            proto_timeout,
            proto_retries,
            proto_verbose,
            proto_port,
            is_resource,
            simulator_active,
            host_cpu,
            host_ram,
            host_disk,
            threshold,
            limit,
            monitor_period,
            exec_min,
            exec_max,
        })
    }

    /// Composite wait used for host responses and the reservation idle bound.
    pub fn host_wait(&self) -> Duration {
        self.proto_timeout * self.proto_retries
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display + Copy>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(
                "{} parameter invalid in received configuration. Defaulting to {}",
                key, default
            );
            default
        }),
    }
}

fn flag_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.trim().to_uppercase()) {
        None => default,
        Some(v) if v == "TRUE" => true,
        Some(v) if v == "FALSE" => false,
        Some(v) => {
            warn!(
                "{} parameter ({}) invalid in received configuration. Defaulting to {}",
                key, v, default
            );
            default
        }
    }
}

fn require_num(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<f64> {
    get(key)
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or_else(|| Error::Config(format!("{} argument invalid or missing", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("CONTROLLER_DECOY_MAC".into(), "02:00:00:00:00:ff".into());
        params.insert("CONTROLLER_DECOY_IP".into(), "10.0.0.254".into());
        params.insert("NODE_IP".into(), "10.0.0.1".into());
        params.insert("NODE_MAC".into(), "02:00:00:00:00:01".into());
        params
    }

    #[test]
    fn missing_decoy_address_is_fatal() {
        let mut params = base_params();
        params.remove("CONTROLLER_DECOY_MAC");
        assert!(matches!(Settings::resolve(&params), Err(Error::Config(_))));
    }

    #[test]
    fn defaults_apply_when_parameters_absent() {
        let settings = Settings::resolve(&base_params()).unwrap();
        assert_eq!(settings.proto_timeout, Duration::from_secs(2));
        assert_eq!(settings.proto_retries, 3);
        assert!(!settings.is_resource);
        assert_eq!(settings.host_wait(), Duration::from_secs(6));
    }

    #[test]
    fn simulated_resource_requires_capacities() {
        let mut params = base_params();
        params.insert("IS_RESOURCE".into(), "True".into());
        params.insert("SIMULATOR_ACTIVE".into(), "True".into());
        assert!(Settings::resolve(&params).is_err());

        params.insert("HOST_CPU".into(), "4".into());
        params.insert("HOST_RAM".into(), "4096".into());
        params.insert("HOST_DISK".into(), "100".into());
        let settings = Settings::resolve(&params).unwrap();
        assert_eq!(settings.host_cpu, 4.0);
        assert_eq!(settings.host_ram, 4096.0);
    }

    #[test]
    fn invalid_exec_interval_falls_back() {
        let mut params = base_params();
        params.insert("SIMULATOR_EXEC_MIN".into(), "5".into());
        params.insert("SIMULATOR_EXEC_MAX".into(), "2".into());
        let settings = Settings::resolve(&params).unwrap();
        assert_eq!(settings.exec_min, 0.0);
        assert_eq!(settings.exec_max, 1.0);
    }
}
