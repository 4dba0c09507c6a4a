use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::CoS;

/// One Class of Service as the orchestrator describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct CosDto {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub min_cpu: f64,
    #[serde(default)]
    pub min_ram: f64,
    #[serde(default)]
    pub min_disk: f64,
    #[serde(default = "unbounded")]
    pub max_response_time: f64,
}

fn unbounded() -> f64 {
    f64::MAX
}

impl From<CosDto> for CoS {
    fn from(dto: CosDto) -> CoS {
        CoS {
            id: dto.id,
            name: dto.name,
            min_cpu: dto.min_cpu,
            min_ram: dto.min_ram,
            min_disk: dto.min_disk,
            max_response_time: dto.max_response_time,
        }
    }
}

/// Everything the orchestrator hands out at startup: protocol parameters
/// to overlay on the environment plus the CoS catalogue.
#[derive(Debug, Default, Deserialize)]
pub struct OrchConfigDto {
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub cos: Vec<CosDto>,
}

/// Node registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDto {
    pub id: String,
    pub label: String,
    pub mode: String,
    pub ip: String,
    pub mac: String,
}

/// Specs update payload.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSpecsDto {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}
