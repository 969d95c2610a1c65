//! Forwarder: a lazily-built pool of connections to peer controllers, used
//! to relay a command to whichever replica owns the target agent.
//!
//! Double-checked locking around `get_or_create`, 5s dial / 30s call
//! deadlines, and removing a cached connection on any RPC failure so the
//! next call redials, over a `tokio::sync::RwLock`-guarded map of
//! `tonic::transport::Channel`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetd_proto::agent::{Command, CommandResponse};
use fleetd_proto::controller::controller_service_client::ControllerServiceClient;
use fleetd_proto::controller::ForwardCommandRequest;
use thiserror::Error;
use tokio::sync::RwLock;
use tonic::transport::Channel;
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to dial controller at {address}")]
    DialFailed { address: String },

    #[error("forward rpc to {address} failed: {source}")]
    Failed { address: String, source: tonic::Status },

    #[error("controller at {address} rejected the forwarded command: {reason}")]
    Rejected { address: String, reason: String },
}

pub type ForwardResult<T> = Result<T, ForwardError>;

/// Pooled cross-controller forward client. Cheaply `Clone`-able: an
/// `Arc<RwLock<_>>` handle over the connection map.
#[derive(Clone, Default)]
pub struct Forwarder {
    clients: Arc<RwLock<HashMap<String, ControllerServiceClient<Channel>>>>,
}

impl Forwarder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, target_fqdn: &str) -> ForwardResult<ControllerServiceClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(target_fqdn) {
            return Ok(client.clone());
        }

        let mut guard = self.clients.write().await;
        if let Some(client) = guard.get(target_fqdn) {
            return Ok(client.clone());
        }

        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{target_fqdn}"))
            .map_err(|_| ForwardError::DialFailed { address: target_fqdn.to_string() })?
            .connect_timeout(DIAL_TIMEOUT);
        let channel = endpoint.connect().await.map_err(|_| ForwardError::DialFailed { address: target_fqdn.to_string() })?;
        let client = ControllerServiceClient::new(channel);
        guard.insert(target_fqdn.to_string(), client.clone());
        debug!(target_fqdn, "opened forward connection");
        Ok(client)
    }

    async fn remove(&self, target_fqdn: &str) {
        self.clients.write().await.remove(target_fqdn);
    }

    /// Forwards `command` to `target_fqdn` and returns the agent's
    /// response, or a [`ForwardError`].
    pub async fn forward(&self, target_fqdn: &str, command: Command) -> ForwardResult<CommandResponse> {
        let mut client = self.get_or_create(target_fqdn).await?;

        let mut request = tonic::Request::new(ForwardCommandRequest { command: Some(command) });
        request.set_timeout(CALL_TIMEOUT);

        let reply = match client.forward_command(request).await {
            Ok(response) => response.into_inner(),
            Err(source) => {
                self.remove(target_fqdn).await;
                warn!(target_fqdn, error = %source, "forward rpc failed, dropping cached connection");
                return Err(ForwardError::Failed { address: target_fqdn.to_string(), source });
            }
        };

        if !reply.success {
            return Err(ForwardError::Rejected { address: target_fqdn.to_string(), reason: reply.error });
        }

        reply.response.ok_or_else(|| ForwardError::Rejected { address: target_fqdn.to_string(), reason: "missing response body".into() })
    }

    /// Drops every cached connection, part of the shutdown sequence.
    pub async fn close(&self) {
        self.clients.write().await.clear();
    }
}
