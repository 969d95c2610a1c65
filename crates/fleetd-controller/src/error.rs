//! Top-level error type for startup failures, distinguished only so `main`
//! can choose an exit code (spec.md §6: "nonzero on listener bind or
//! mandatory initialization failure").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to bind discovery endpoint at {address}: {source}")]
    DiscoveryBind { address: String, source: tonic::transport::Error },

    #[error("failed to bind agent endpoint at {address}: {source}")]
    AgentBind { address: String, source: tonic::transport::Error },

    #[error("failed to connect to registry: {0}")]
    Registry(#[from] fleetd_registry_client::RegistryError),
}
