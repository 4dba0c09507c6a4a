pub mod config_dto;

use log::debug;
use reqwest::StatusCode;

use crate::error::Result;
use crate::persistence::RequestRecord;
use config_dto::{NodeDto, NodeSpecsDto, OrchConfigDto};

/// Facade over the orchestrator's REST API.
///
/// Hides the framework-specific endpoints behind plain methods; the
/// protocol engine itself only ever needs [`OrchestratorApi::get_config`],
/// the rest belongs to the node lifecycle around it.
pub struct OrchestratorApi {
    base: String,
    http: reqwest::Client,
}

impl OrchestratorApi {
    pub fn new(server_ip: &str, api_port: u16) -> OrchestratorApi {
        OrchestratorApi {
            base: format!("http://{}:{}", server_ip, api_port),
            http: reqwest::Client::new(),
        }
    }

    /// Fetches protocol parameters and the CoS catalogue.
    pub async fn get_config(&self) -> Result<OrchConfigDto> {
        let config = self
            .http
            .get(format!("{}/config", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(config)
    }

    /// Registers the node in the orchestrated topology. Re-registering an
    /// existing node is not an error.
    pub async fn add_node(&self, node: &NodeDto) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/node", self.base))
            .json(node)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Node {} already known to the orchestrator", node.id);
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    /// Removes the node from the orchestrated topology.
    pub async fn delete_node(&self, id: &str) -> Result<()> {
        self.http
            .delete(format!("{}/node/{}", self.base, id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Pushes updated node specs (including interface specs).
    pub async fn update_node_specs(&self, id: &str, specs: &NodeSpecsDto) -> Result<()> {
        self.http
            .put(format!("{}/node_specs/{}", self.base, id))
            .json(specs)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Mirrors a terminal request snapshot into the orchestrator's store.
    pub async fn add_request(&self, record: &RequestRecord) -> Result<()> {
        self.http
            .post(format!("{}/request", self.base))
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn add_iperf3_listeners(&self, id: &str) -> Result<()> {
        self.http
            .post(format!("{}/iperf3/{}", self.base, id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn get_iperf3_target(&self, id: &str, iface: &str) -> Result<String> {
        let target = self
            .http
            .get(format!("{}/iperf3/{}/{}", self.base, id, iface))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(target)
    }

    pub async fn delete_iperf3_listeners(&self, id: &str) -> Result<()> {
        self.http
            .delete(format!("{}/iperf3/{}", self.base, id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
