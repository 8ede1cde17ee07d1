//! reqwest client for the control-plane HTTP API.
//!
//! Every method is a JSON `POST {base_url}/api/{network}/{method}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ControlPlane, ControlPlaneError, Topology, TrafficRequest};
use crate::config::ControlPlaneConfig;

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    networks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StartTrafficResponse {
    id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusTrafficResponse {
    #[serde(default)]
    sessions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TrafficOutputResponse {
    output: Option<String>,
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            networks: config.networks.clone(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        network_name: &str,
        method: &str,
        body: Value,
    ) -> Result<T, ControlPlaneError> {
        let url = format!("{}/api/{}/{}", self.base_url, network_name, method);
        debug!(%url, "control plane request");

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::UnknownNetwork(network_name.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                method: method.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    fn networks(&self) -> Vec<String> {
        self.networks.clone()
    }

    async fn get_topology(&self, network_name: &str) -> Result<Topology, ControlPlaneError> {
        self.request(network_name, "getTopology", json!({})).await
    }

    async fn start_traffic(
        &self,
        network_name: &str,
        request: &TrafficRequest,
    ) -> Result<String, ControlPlaneError> {
        let body = serde_json::to_value(request).unwrap_or_else(|_| json!({}));
        let response: StartTrafficResponse =
            self.request(network_name, "startTraffic", body).await?;

        match response {
            StartTrafficResponse { id: Some(id), .. } => Ok(id),
            StartTrafficResponse { message, .. } => Err(ControlPlaneError::Rejected {
                method: "startTraffic".to_string(),
                message: message.unwrap_or_else(|| "no session id returned".to_string()),
            }),
        }
    }

    async fn stop_traffic(
        &self,
        network_name: &str,
        session_id: &str,
    ) -> Result<(), ControlPlaneError> {
        let _: Value = self
            .request(network_name, "stopTraffic", json!({ "id": session_id }))
            .await?;
        Ok(())
    }

    async fn list_active_sessions(
        &self,
        network_name: &str,
    ) -> Result<Vec<String>, ControlPlaneError> {
        let response: StatusTrafficResponse =
            self.request(network_name, "statusTraffic", json!({})).await?;
        Ok(response.sessions)
    }

    async fn traffic_output(
        &self,
        network_name: &str,
        session_id: &str,
    ) -> Result<Option<String>, ControlPlaneError> {
        let response: TrafficOutputResponse = self
            .request(network_name, "getTrafficOutput", json!({ "id": session_id }))
            .await?;
        Ok(response.output)
    }
}
