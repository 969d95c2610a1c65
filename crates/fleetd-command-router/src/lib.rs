//! Command router (spec.md §4.G): envelope assembly, correlated
//! request/response over an agent's live `CommandStream`, per-call timeout.
//!
//! Grounded on `controller/client/services/commands.go`'s `SendCommand`
//! (command-id generation, pending-response registration, 15s timeout) and
//! `HandleCommandResponse` (non-blocking correlate-and-drop), translated
//! from its buffered-channel-per-command-id map into a
//! `oneshot::Sender`-per-command-id table — a single-capacity response slot
//! is exactly what a oneshot is for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetd_agent_protocol::{CommandId, DispatchError, DispatchResult, IdentityError};
use fleetd_agent_session::AgentSessionTable;
use fleetd_proto::agent::{command, Command, CommandResponse, Identity};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Round-trip deadline for a single command (spec.md §4.G step 6, and
/// reused by 4.K for forwarded commands).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CommandResponse>>>>;

/// The pending-response table, deliberately a separate lock from
/// [`AgentSessionTable`]'s internal one to avoid lock-order inversions
/// (spec.md §5: "Pending-response table: separate lock from the agent
/// table").
#[derive(Clone, Default)]
pub struct PendingResponses {
    slots: PendingMap,
}

impl PendingResponses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, command_id: &str) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().expect("lock poisoned").insert(command_id.to_string(), tx);
        rx
    }

    fn deregister(&self, command_id: &str) {
        self.slots.lock().expect("lock poisoned").remove(command_id);
    }

    /// Correlates an inbound `CommandResponse` to its pending slot and
    /// performs a non-blocking hand-off. If the slot is absent (already
    /// timed out, cancelled, or a duplicate response), the response is
    /// logged and dropped — never blocks the stream-reader loop that
    /// calls this (spec.md §4.G).
    pub fn complete(&self, response: CommandResponse) {
        let slot = self.slots.lock().expect("lock poisoned").remove(&response.command_id);
        match slot {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("pending response slot's receiver already dropped");
                }
            }
            None => warn!(command_id = %response.command_id, "no pending slot for command response, dropping"),
        }
    }
}

/// Routes commands to connected agents, correlating responses by
/// `command_id`. Reused as-is by the command-response server (spec.md
/// §4.K) for forwarded commands, since both share this same table.
#[derive(Clone)]
pub struct CommandRouter {
    sessions: AgentSessionTable,
    pending: PendingResponses,
}

impl CommandRouter {
    #[must_use]
    pub fn new(sessions: AgentSessionTable, pending: PendingResponses) -> Self {
        Self { sessions, pending }
    }

    #[must_use]
    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    /// Sends a fresh, locally-originated command and waits for its
    /// response (spec.md §4.G steps 1-6).
    pub async fn send(&self, client_id: &str, r#type: &str, subtype: &str, payload: command::Payload) -> DispatchResult<CommandResponse> {
        let command_id = CommandId::generate();
        self.send_with_id(client_id, command_id.0, r#type, subtype, payload).await
    }

    /// Sends a command reusing an already-assigned `command_id` (spec.md
    /// §4.K: "the originator chose it"), otherwise identical to [`send`](Self::send).
    pub async fn send_with_id(
        &self,
        client_id: &str,
        command_id: String,
        r#type: &str,
        subtype: &str,
        payload: command::Payload,
    ) -> DispatchResult<CommandResponse> {
        let record = self.sessions.record(client_id).await.ok_or(IdentityError::UnknownClient)?;
        let envelope = Command {
            command_id: command_id.clone(),
            r#type: r#type.to_string(),
            subtype: subtype.to_string(),
            identity: Some(Identity { client_id: client_id.to_string(), session_token: record.session_token }),
            payload: Some(payload),
        };
        self.write_and_wait(client_id, envelope).await
    }

    /// Relays an already-fully-built [`Command`] straight to `client_id`'s
    /// stream, unmodified (spec.md §4.K: the command-response server
    /// forwards a peer-originated envelope as-is, it does not rebuild
    /// identity). Reuses this table's pending-response correlation.
    pub async fn relay(&self, client_id: &str, command: Command) -> DispatchResult<CommandResponse> {
        self.write_and_wait(client_id, command).await
    }

    async fn write_and_wait(&self, client_id: &str, envelope: Command) -> DispatchResult<CommandResponse> {
        let handle = self.sessions.stream_handle(client_id).await.ok_or(IdentityError::NotConnected)?;
        let command_id = envelope.command_id.clone();
        let rx = self.pending.register(&command_id);

        if handle.tx.send(Ok(envelope)).await.is_err() {
            self.pending.deregister(&command_id);
            return Err(DispatchError::SendFailed);
        }

        tokio::select! {
            response = rx => {
                response.map_err(|_| DispatchError::Cancelled)
            }
            () = handle.cancel.cancelled() => {
                self.pending.deregister(&command_id);
                Err(DispatchError::Cancelled)
            }
            () = tokio::time::sleep(COMMAND_TIMEOUT) => {
                self.pending.deregister(&command_id);
                Err(DispatchError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fleetd_agent_session::RegisterRequest;
    use fleetd_proto::agent::RequestClientStats;
    use fleetd_store::MemoryStore;
    use tokio::sync::mpsc;

    use super::*;

    fn req(client_id: &str) -> RegisterRequest {
        RegisterRequest {
            token: "t".into(),
            client_id: client_id.into(),
            name: "agent".into(),
            hostname: "h".into(),
            version: "1".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            kernel: "6.1".into(),
            projects: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn send_fails_fast_when_not_connected() {
        let sessions = AgentSessionTable::new(vec!["t".into()]);
        let store = MemoryStore::new();
        sessions.register(&store, req("c1")).await.unwrap();

        let router = CommandRouter::new(sessions, PendingResponses::new());
        let err = router.send("c1", "client_stats", "", command::Payload::ClientStats(RequestClientStats {})).await.unwrap_err();
        assert!(matches!(err, DispatchError::Identity(IdentityError::NotConnected)));
    }

    #[tokio::test]
    async fn send_correlates_response_by_command_id() {
        let sessions = AgentSessionTable::new(vec!["t".into()]);
        let store = MemoryStore::new();
        sessions.register(&store, req("c1")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        sessions.attach_stream("c1", tx).await.unwrap();

        let pending = PendingResponses::new();
        let router = CommandRouter::new(sessions, pending.clone());

        let send_fut = router.send("c1", "client_stats", "", command::Payload::ClientStats(RequestClientStats {}));
        let responder = async {
            let sent = rx.recv().await.unwrap().unwrap();
            pending.complete(CommandResponse { command_id: sent.command_id, identity: sent.identity, success: true, error: String::new(), result: None });
        };

        let (response, ()) = tokio::join!(send_fut, responder);
        assert!(response.unwrap().success);
    }

    #[tokio::test]
    async fn send_times_out_when_no_response_arrives() {
        tokio::time::pause();
        let sessions = AgentSessionTable::new(vec!["t".into()]);
        let store = MemoryStore::new();
        sessions.register(&store, req("c1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        sessions.attach_stream("c1", tx).await.unwrap();

        let router = CommandRouter::new(sessions, PendingResponses::new());
        let send_fut = router.send("c1", "client_stats", "", command::Payload::ClientStats(RequestClientStats {}));
        tokio::pin!(send_fut);

        tokio::time::advance(COMMAND_TIMEOUT + Duration::from_secs(1)).await;
        let err = send_fut.await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));
    }

    #[tokio::test]
    async fn cancelling_the_agent_stream_fails_pending_command() {
        let sessions = AgentSessionTable::new(vec!["t".into()]);
        let store = MemoryStore::new();
        sessions.register(&store, req("c1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        sessions.attach_stream("c1", tx).await.unwrap();

        let router = CommandRouter::new(sessions.clone(), PendingResponses::new());
        let send_fut = router.send("c1", "client_stats", "", command::Payload::ClientStats(RequestClientStats {}));
        tokio::pin!(send_fut);

        // Detaching cancels the stream's token, which the select! races against.
        let detach = sessions.detach(&store, "c1");
        let (detach_result, send_result) = tokio::join!(detach, send_fut);
        detach_result.unwrap();
        assert!(matches!(send_result.unwrap_err(), DispatchError::Cancelled));
    }
}
