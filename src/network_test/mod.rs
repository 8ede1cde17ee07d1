//! Network test campaigns: definitions, asset resolution, and execution.

pub mod assets;
pub mod definition;
pub mod execution;
pub mod iperf;

use thiserror::Error;

use crate::controlplane::ControlPlaneError;

pub use self::assets::{prepare, resolve_assets, Asset, PreparedTest};
pub use self::definition::{
    AssetScope, Protocol, Strategy, TestDefinition, TestStatus, TestType, TrafficOptions,
};
pub use self::execution::{ExecutionState, StopReport, TestExecution};

#[derive(Debug, Error)]
pub enum InvalidValue {
    #[error("unknown test type: {0}")]
    TestType(String),

    #[error("unknown test status: {0}")]
    TestStatus(String),

    #[error("timeSec must be between 1 and 86400 seconds, got {0}")]
    TimeSec(u64),
}

/// Why a test could not be prepared. Callers treat every variant as a
/// "not started" outcome rather than a fault.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to fetch topology for {network}: {source}")]
    Topology {
        network: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("no testable assets found on {0}")]
    NoAssets(String),

    #[error("no assets on {0} match the allow-list")]
    NoMatchingAssets(String),
}
