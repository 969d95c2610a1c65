//! Registry client (spec.md §4.H): a single process-wide handle to the
//! cross-controller client-ownership registry, plus its re-registration
//! health monitor.
//!
//! Grounded on `pkg/registry/client.go`'s `RegistryClient`: hostname-based
//! `controller_id`/`grpc_address` auto-detection (`buildGRPCAddress`'s
//! Kubernetes-StatefulSet FQDN logic), per-call timeouts, and
//! `StartHealthMonitor`'s 30s ticker, translated into a `tokio::select!`
//! loop in the style of `kimberlite-cluster::ClusterSupervisor::monitor_loop`.

use std::time::Duration;

use fleetd_proto::controller::controller_service_client::ControllerServiceClient;
use fleetd_proto::controller::{
    BulkSetClientLocationsRequest, ClientLocationRequest, ClientRefreshRequest, ControllerInfo, IsControllerRegisteredRequest, SetClientLocationRequest,
};
use thiserror::Error;
use tonic::transport::Channel;
use tracing::{info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
const REGISTER_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const BULK_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to connect to registry at {address}: {source}")]
    Connect { address: String, source: tonic::transport::Error },

    #[error("registry rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("registry reported failure: {0}")]
    Rejected(String),

    #[error("client not found in registry: {0}")]
    ClientNotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registry_address: String,
    pub controller_id: Option<String>,
    pub grpc_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDetails {
    pub controller_id: String,
    pub controller_fqdn: String,
}

/// Auto-detects a Kubernetes StatefulSet FQDN from `POD_NAMESPACE` and
/// `CONTROLLER_SERVICE_NAME`, falling back to `hostname:50051` otherwise
/// (spec.md §4.H, original's `buildGRPCAddress`).
#[must_use]
pub fn detect_grpc_address(hostname: &str) -> String {
    let namespace = std::env::var("POD_NAMESPACE").ok().filter(|v| !v.is_empty());
    let Some(namespace) = namespace else {
        return format!("{hostname}:50051");
    };
    match std::env::var("CONTROLLER_SERVICE_NAME").ok().filter(|v| !v.is_empty()) {
        Some(service_name) => format!("{hostname}.{service_name}.{namespace}.svc.cluster.local:50051"),
        None => format!("{hostname}.{namespace}.svc.cluster.local:50051"),
    }
}

/// Single process-wide handle to the registry (spec.md §4.H).
pub struct RegistryClient {
    client: ControllerServiceClient<Channel>,
    controller_id: String,
    grpc_address: String,
}

impl RegistryClient {
    /// Resolves `controller_id`/`grpc_address` from config or the local
    /// hostname, then connects.
    pub async fn connect(config: RegistryConfig, hostname: &str) -> RegistryResult<Self> {
        let controller_id = config.controller_id.unwrap_or_else(|| hostname.to_string());
        let grpc_address = config.grpc_address.unwrap_or_else(|| detect_grpc_address(hostname));

        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{}", config.registry_address))
            .map_err(|source| RegistryError::Connect { address: config.registry_address.clone(), source })?
            .connect_timeout(DIAL_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| RegistryError::Connect { address: config.registry_address.clone(), source })?;

        info!(registry_address = %config.registry_address, controller_id, grpc_address, "connected to registry");
        Ok(Self { client: ControllerServiceClient::new(channel), controller_id, grpc_address })
    }

    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    #[must_use]
    pub fn grpc_address(&self) -> &str {
        &self.grpc_address
    }

    /// Publishes this controller's `{controller_id, grpc_address}`.
    pub async fn register_controller(&mut self) -> RegistryResult<()> {
        let mut request = tonic::Request::new(ControllerInfo { controller_id: self.controller_id.clone(), grpc_address: self.grpc_address.clone() });
        request.set_timeout(REGISTER_CALL_TIMEOUT);
        let response = self.client.register_controller(request).await?.into_inner();
        if !response.success {
            return Err(RegistryError::Rejected("controller registration failed".into()));
        }
        info!(controller_id = %self.controller_id, grpc_address = %self.grpc_address, "controller registered");
        Ok(())
    }

    /// Polls for liveness of our own registration.
    pub async fn is_controller_registered(&mut self) -> RegistryResult<bool> {
        let mut request = tonic::Request::new(IsControllerRegisteredRequest { controller_id: self.controller_id.clone() });
        request.set_timeout(SHORT_CALL_TIMEOUT);
        Ok(self.client.is_controller_registered(request).await?.into_inner().registered)
    }

    /// Publishes ownership of a single client.
    pub async fn set_client_location(&mut self, client_id: &str) -> RegistryResult<()> {
        let mut request = tonic::Request::new(SetClientLocationRequest { client_id: client_id.to_string(), controller_id: self.controller_id.clone() });
        request.set_timeout(SHORT_CALL_TIMEOUT);
        let response = self.client.set_client_location(request).await?.into_inner();
        if !response.success {
            return Err(RegistryError::Rejected(response.error));
        }
        Ok(())
    }

    /// Publishes ownership of many clients in one call; a no-op for an
    /// empty list.
    pub async fn bulk_set_client_locations(&mut self, client_ids: &[String]) -> RegistryResult<()> {
        if client_ids.is_empty() {
            return Ok(());
        }
        let mut request =
            tonic::Request::new(BulkSetClientLocationsRequest { controller_id: self.controller_id.clone(), client_ids: client_ids.to_vec() });
        request.set_timeout(BULK_CALL_TIMEOUT);
        let response = self.client.bulk_set_client_locations(request).await?.into_inner();
        if !response.success {
            return Err(RegistryError::Rejected(response.error));
        }
        info!(updated = response.updated_count, requested = client_ids.len(), "bulk client locations updated");
        Ok(())
    }

    /// Looks up which controller currently owns `client_id`.
    pub async fn get_client_details(&mut self, client_id: &str) -> RegistryResult<ClientDetails> {
        let mut request = tonic::Request::new(ClientLocationRequest { client_id: client_id.to_string() });
        request.set_timeout(SHORT_CALL_TIMEOUT);
        let response = self.client.get_client_location(request).await?.into_inner();
        if !response.found {
            return Err(RegistryError::ClientNotFound(client_id.to_string()));
        }
        Ok(ClientDetails { controller_id: response.controller_id, controller_fqdn: response.controller_fqdn })
    }

    /// Asks the registry to re-query all controllers (used after a
    /// registry restart).
    pub async fn request_client_refresh(&mut self) -> RegistryResult<()> {
        let mut request = tonic::Request::new(ClientRefreshRequest { controller_id: self.controller_id.clone() });
        request.set_timeout(REGISTER_CALL_TIMEOUT);
        let response = self.client.request_client_refresh(request).await?.into_inner();
        if !response.success {
            return Err(RegistryError::Rejected(response.error));
        }
        Ok(())
    }

    /// Every 30 s, if any agent is connected here, verifies our
    /// registration is still live and re-registers plus bulk-uploads
    /// current owners on failure (spec.md §4.H state machine: `Healthy ->
    /// Registered -> Healthy` recovered here). Runs until cancelled.
    pub async fn run_health_monitor<F>(&mut self, mut get_connected_clients: F, cancel: tokio_util::sync::CancellationToken)
    where
        F: FnMut() -> Vec<String>,
    {
        let mut tick = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let connected = get_connected_clients();
                    if connected.is_empty() {
                        continue;
                    }
                    match self.is_controller_registered().await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(controller_id = %self.controller_id, "controller not registered, re-registering");
                            if let Err(err) = self.register_controller().await {
                                warn!(error = %err, "re-registration failed");
                                continue;
                            }
                            if let Err(err) = self.bulk_set_client_locations(&connected).await {
                                warn!(error = %err, "failed to re-upload client ownership after re-registration");
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to check controller registration"),
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    // SAFETY: these tests mutate process-global env vars; the test binary
    // runs this module's tests on a single thread's worth of env state by
    // construction (no other test in this crate touches these two keys).
    fn with_env(pod_namespace: Option<&str>, service_name: Option<&str>, body: impl FnOnce()) {
        unsafe {
            match pod_namespace {
                Some(v) => std::env::set_var("POD_NAMESPACE", v),
                None => std::env::remove_var("POD_NAMESPACE"),
            }
            match service_name {
                Some(v) => std::env::set_var("CONTROLLER_SERVICE_NAME", v),
                None => std::env::remove_var("CONTROLLER_SERVICE_NAME"),
            }
        }
        body();
        unsafe {
            std::env::remove_var("POD_NAMESPACE");
            std::env::remove_var("CONTROLLER_SERVICE_NAME");
        }
    }

    #[test]
    fn detect_grpc_address_falls_back_to_hostname_port() {
        with_env(None, None, || {
            assert_eq!(detect_grpc_address("host-1"), "host-1:50051");
        });
    }

    #[test]
    fn detect_grpc_address_builds_statefulset_fqdn_with_service() {
        with_env(Some("fleet-ns"), Some("fleetd-controller"), || {
            assert_eq!(detect_grpc_address("host-1"), "host-1.fleetd-controller.fleet-ns.svc.cluster.local:50051");
        });
    }

    #[test]
    fn detect_grpc_address_builds_namespace_only_fqdn_without_service() {
        with_env(Some("fleet-ns"), None, || {
            assert_eq!(detect_grpc_address("host-1"), "host-1.fleet-ns.svc.cluster.local:50051");
        });
    }
}
