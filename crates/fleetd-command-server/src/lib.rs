//! Command-response server: the gRPC-facing half of `ControllerService` that
//! terminates an inbound `ForwardCommand` from a peer controller replica by
//! injecting it into the target agent's own `CommandStream` and waiting for
//! the correlated response.
//!
//! Validates the command and client id, then reuses
//! [`fleetd_command_router::CommandRouter::relay`] for the pending-slot
//! correlation and the 15 s wait rather than re-implementing it.

use fleetd_agent_protocol::DispatchError;
use fleetd_command_router::CommandRouter;
use fleetd_proto::agent::Identity;
use fleetd_proto::controller::controller_service_server::ControllerService;
use fleetd_proto::controller::{
    BulkSetClientLocationsRequest, BulkSetClientLocationsResponse, ClientLocationRequest, ClientLocationResponse, ClientRefreshRequest, ClientRefreshResponse,
    ControllerInfo, ControllerResponse, ForwardCommandRequest, ForwardCommandResponse, IsControllerRegisteredRequest, IsControllerRegisteredResponse,
    SetClientLocationRequest, SetClientLocationResponse,
};
use tonic::{Request, Response, Status};
use tracing::warn;

/// The `ControllerService` gRPC endpoint this replica exposes to its peers.
/// Only `forward_command` does real work; the registry-facing RPCs are
/// no-ops here because a registry is a distinct role this process may or
/// may not also play.
pub struct CommandServer {
    router: CommandRouter,
}

impl CommandServer {
    #[must_use]
    pub fn new(router: CommandRouter) -> Self {
        Self { router }
    }
}

#[tonic::async_trait]
impl ControllerService for CommandServer {
    async fn forward_command(&self, request: Request<ForwardCommandRequest>) -> Result<Response<ForwardCommandResponse>, Status> {
        let Some(command) = request.into_inner().command else {
            return Ok(Response::new(ForwardCommandResponse { success: false, error: "command is nil".into(), response: None }));
        };

        let client_id = match &command.identity {
            Some(Identity { client_id, .. }) if !client_id.is_empty() => client_id.clone(),
            _ => return Ok(Response::new(ForwardCommandResponse { success: false, error: "client_id is empty".into(), response: None })),
        };

        match self.router.relay(&client_id, command).await {
            Ok(response) => Ok(Response::new(ForwardCommandResponse { success: true, error: String::new(), response: Some(response) })),
            Err(err) => {
                warn!(client_id, error = %err, "forwarded command failed");
                Ok(Response::new(ForwardCommandResponse { success: false, error: describe(&err), response: None }))
            }
        }
    }

    async fn register_controller(&self, _request: Request<ControllerInfo>) -> Result<Response<ControllerResponse>, Status> {
        Ok(Response::new(ControllerResponse { success: false }))
    }

    async fn is_controller_registered(&self, _request: Request<IsControllerRegisteredRequest>) -> Result<Response<IsControllerRegisteredResponse>, Status> {
        Ok(Response::new(IsControllerRegisteredResponse { registered: false }))
    }

    async fn set_client_location(&self, _request: Request<SetClientLocationRequest>) -> Result<Response<SetClientLocationResponse>, Status> {
        Ok(Response::new(SetClientLocationResponse { success: false, error: "not a registry".into() }))
    }

    async fn bulk_set_client_locations(&self, _request: Request<BulkSetClientLocationsRequest>) -> Result<Response<BulkSetClientLocationsResponse>, Status> {
        Ok(Response::new(BulkSetClientLocationsResponse { success: false, error: "not a registry".into(), updated_count: 0 }))
    }

    async fn get_client_location(&self, _request: Request<ClientLocationRequest>) -> Result<Response<ClientLocationResponse>, Status> {
        Ok(Response::new(ClientLocationResponse { found: false, controller_id: String::new(), controller_fqdn: String::new() }))
    }

    async fn request_client_refresh(&self, _request: Request<ClientRefreshRequest>) -> Result<Response<ClientRefreshResponse>, Status> {
        Ok(Response::new(ClientRefreshResponse { success: false, error: "not a registry".into() }))
    }
}

/// Human-readable reply text for a failed forward.
fn describe(err: &DispatchError) -> String {
    match err {
        DispatchError::Identity(_) => "client not connected".to_string(),
        DispatchError::SendFailed => "failed to send command to client".to_string(),
        DispatchError::Timeout => "command timeout".to_string(),
        DispatchError::Cancelled => "command cancelled".to_string(),
        other => other.to_string(),
    }
}
