//! Control-plane collaborator: topology snapshots and traffic sessions.
//!
//! Every call is scoped to one network and may fail independently of the
//! others. Callers downgrade these failures to log entries plus a skip.

pub mod http;
pub mod topology;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network_test::TrafficOptions;

pub use self::http::HttpControlPlane;
pub use self::topology::{Link, LinkType, Node, Topology};

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("control plane returned HTTP {status} for {method}: {message}")]
    Api {
        method: String,
        status: u16,
        message: String,
    },

    #[error("{method} rejected by control plane: {message}")]
    Rejected { method: String, message: String },

    #[error("network {0} is unknown to the control plane")]
    UnknownNetwork(String),
}

/// A single directional traffic session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRequest {
    pub src_node_id: String,
    pub dst_node_id: String,
    pub options: TrafficOptions,
}

/// Trait for the control-plane API driving the network under test.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Networks this control plane manages.
    fn networks(&self) -> Vec<String>;

    async fn get_topology(&self, network_name: &str) -> Result<Topology, ControlPlaneError>;

    /// Start one traffic session, returning its opaque session id.
    async fn start_traffic(
        &self,
        network_name: &str,
        request: &TrafficRequest,
    ) -> Result<String, ControlPlaneError>;

    async fn stop_traffic(&self, network_name: &str, session_id: &str)
        -> Result<(), ControlPlaneError>;

    async fn list_active_sessions(&self, network_name: &str)
        -> Result<Vec<String>, ControlPlaneError>;

    /// Raw traffic generator output of a completed session, if the control
    /// plane retains it.
    async fn traffic_output(
        &self,
        _network_name: &str,
        _session_id: &str,
    ) -> Result<Option<String>, ControlPlaneError> {
        Ok(None)
    }
}
