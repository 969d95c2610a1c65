//! The `CommandService` gRPC endpoint: agent registration and the
//! bidirectional `CommandStream`.
//!
//! `register` mints a client id and session token; `command_stream`'s first
//! inbound message is the identity handshake, every message after is a
//! correlated response. Wired the way [`fleetd_discovery::DiscoveryServer`]
//! wires its own per-stream transport loop around a callback set: this type
//! owns no tonic-specific state beyond the session table and
//! pending-response table it is handed.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetd_agent_session::{AgentSessionTable, RegisterRequest as SessionRegisterRequest};
use fleetd_command_router::PendingResponses;
use fleetd_proto::agent::command_service_server::CommandService;
use fleetd_proto::agent::{Command, CommandResponse, RegisterRequest, RegisterResponse, UnregisterRequest, UnregisterResponse};
use fleetd_store::Store;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

const OUTBOUND_CHANNEL_CAPACITY: usize = 16;

pub struct AgentServer<S> {
    store: Arc<S>,
    sessions: AgentSessionTable,
    pending: PendingResponses,
}

impl<S> AgentServer<S> {
    #[must_use]
    pub fn new(store: Arc<S>, sessions: AgentSessionTable, pending: PendingResponses) -> Self {
        Self { store, sessions, pending }
    }
}

#[tonic::async_trait]
impl<S> CommandService for AgentServer<S>
where
    S: Store + Send + Sync + 'static,
{
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let client_id = uuid::Uuid::new_v4().to_string();
        let session_req = SessionRegisterRequest {
            token: req.token,
            client_id: client_id.clone(),
            name: req.name,
            hostname: req.hostname,
            version: req.version,
            os: req.os,
            arch: req.arch,
            kernel: req.kernel,
            projects: req.projects,
            metadata: req.metadata.into_iter().collect::<BTreeMap<_, _>>(),
        };

        match self.sessions.register(self.store.as_ref(), session_req).await {
            Ok((session_token, record)) => {
                Ok(Response::new(RegisterResponse { success: true, error: String::new(), session_token: session_token.0, client_id: record.client_id }))
            }
            Err(err) => Ok(Response::new(RegisterResponse { success: false, error: err.to_string(), session_token: String::new(), client_id: String::new() })),
        }
    }

    async fn unregister(&self, request: Request<UnregisterRequest>) -> Result<Response<UnregisterResponse>, Status> {
        let Some(identity) = request.into_inner().identity else {
            return Ok(Response::new(UnregisterResponse { success: false, error: "identity is empty".into() }));
        };
        if let Err(err) = self.sessions.validate_session(self.store.as_ref(), &identity.client_id, &identity.session_token).await {
            return Ok(Response::new(UnregisterResponse { success: false, error: err.to_string() }));
        }
        self.sessions.unregister(&identity.client_id).await;
        Ok(Response::new(UnregisterResponse { success: true, error: String::new() }))
    }

    type CommandStreamStream = ReceiverStream<Result<Command, Status>>;

    async fn command_stream(&self, request: Request<Streaming<CommandResponse>>) -> Result<Response<Self::CommandStreamStream>, Status> {
        let mut in_stream = request.into_inner();
        let handshake = in_stream
            .message()
            .await
            .map_err(|err| Status::internal(err.to_string()))?
            .ok_or_else(|| Status::invalid_argument("command stream closed before handshake"))?;
        let identity = handshake.identity.ok_or_else(|| Status::invalid_argument("handshake missing identity"))?;

        self.sessions
            .validate_session(self.store.as_ref(), &identity.client_id, &identity.session_token)
            .await
            .map_err(|err| Status::unauthenticated(err.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let cancel = self
            .sessions
            .attach_stream(&identity.client_id, tx)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let pending = self.pending.clone();
        let sessions = self.sessions.clone();
        let store = self.store.clone();
        let client_id = identity.client_id;
        info!(client_id, "agent command stream opened");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = in_stream.message() => {
                        match message {
                            Ok(Some(response)) => pending.complete(response),
                            Ok(None) => break,
                            Err(err) => {
                                warn!(client_id, error = %err, "command stream read error");
                                break;
                            }
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
            let _ = sessions.detach(store.as_ref(), &client_id).await;
            info!(client_id, "agent command stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use fleetd_store::MemoryStore;

    use super::*;

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            token: "good-token".into(),
            name: "agent-1".into(),
            hostname: "host-1".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            kernel: "6.1".into(),
            projects: vec!["P1".into()],
            metadata: std::collections::HashMap::new(),
        }
    }

    #[tokio::test]
    async fn register_mints_client_id_and_session_token() {
        let store = Arc::new(MemoryStore::new());
        let sessions = AgentSessionTable::new(vec!["good-token".into()]);
        let server = AgentServer::new(store, sessions, PendingResponses::new());

        let reply = server.register(Request::new(register_request())).await.unwrap().into_inner();
        assert!(reply.success);
        assert!(!reply.client_id.is_empty());
        assert!(!reply.session_token.is_empty());
    }

    #[tokio::test]
    async fn register_rejects_unknown_token() {
        let store = Arc::new(MemoryStore::new());
        let sessions = AgentSessionTable::new(vec!["good-token".into()]);
        let server = AgentServer::new(store, sessions, PendingResponses::new());

        let mut req = register_request();
        req.token = "bad".into();
        let reply = server.register(Request::new(req)).await.unwrap().into_inner();
        assert!(!reply.success);
        assert!(reply.client_id.is_empty());
    }

    #[tokio::test]
    async fn unregister_rejects_missing_identity() {
        let store = Arc::new(MemoryStore::new());
        let sessions = AgentSessionTable::new(vec!["good-token".into()]);
        let server = AgentServer::new(store, sessions, PendingResponses::new());

        let reply = server.unregister(Request::new(UnregisterRequest { identity: None })).await.unwrap().into_inner();
        assert!(!reply.success);
    }
}
