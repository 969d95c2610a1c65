//! Agent session table: register/unregister, session validation, and
//! per-agent stream ownership.
//!
//! Register mints a session token and upserts the record; validate checks
//! the presented token; attach/detach own the live stream. Backed by a
//! `tokio::sync::RwLock<HashMap<_>>` plus a per-agent `CancellationToken`
//! for cooperative cancellation of whatever is waiting on that stream.
//!
//! A re-register of an already-known `client_id` rotates its session token
//! immediately — the prior token stops validating as soon as the call
//! returns, making registration rather than stream-attach the authority
//! boundary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fleetd_agent_protocol::{IdentityError, SessionToken};
use fleetd_proto::agent::Command;
use fleetd_store::Store;
use fleetd_types::AgentRecord;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::info;

/// What a fresh `register` call needs from the wire request plus the
/// settings-provided token table.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub token: String,
    pub client_id: String,
    pub name: String,
    pub hostname: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub projects: Vec<String>,
    pub metadata: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Store(#[from] fleetd_store::StoreError),
}

/// The live handle to a connected agent's `CommandStream`: an outbound
/// sender (driven by the command router and dispatch handler) plus the
/// cancellation token that unblocks any command pending for this agent
/// when the stream goes away.
#[derive(Clone)]
pub struct StreamHandle {
    pub tx: mpsc::Sender<Result<Command, Status>>,
    pub cancel: CancellationToken,
}

struct Slot {
    record: AgentRecord,
    stream: Option<StreamHandle>,
}

/// Process-wide agent session table. Cheaply `Clone`-able: an `Arc<RwLock<_>>`
/// handle, matching the sharing convention used by [`fleetd_snapshot::SnapshotCache`].
#[derive(Clone)]
pub struct AgentSessionTable {
    allowed_tokens: Arc<Vec<String>>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl AgentSessionTable {
    #[must_use]
    pub fn new(allowed_tokens: Vec<String>) -> Self {
        Self { allowed_tokens: Arc::new(allowed_tokens), slots: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Validates `req.token` against the allowed-token table, mints a fresh
    /// session token, and upserts the record both in memory and in the
    /// store. Re-registering an already-known `client_id` rotates its
    /// token immediately — the prior token stops validating as soon as
    /// this call returns.
    pub async fn register<S: Store>(&self, store: &S, req: RegisterRequest) -> Result<(SessionToken, AgentRecord), SessionError> {
        if !self.allowed_tokens.iter().any(|t| t == &req.token) {
            return Err(SessionError::Identity(IdentityError::BadToken));
        }

        let session_token = SessionToken::generate();
        let record = AgentRecord {
            client_id: req.client_id.clone(),
            session_token: session_token.0.clone(),
            name: req.name,
            version: req.version,
            hostname: req.hostname,
            os: req.os,
            arch: req.arch,
            kernel: req.kernel,
            last_seen: Utc::now(),
            connected: false,
            projects: req.projects,
            access_token: req.token,
            metadata: req.metadata,
        };

        store.upsert_agent(record.clone()).await?;
        self.slots.write().await.insert(req.client_id.clone(), Slot { record: record.clone(), stream: None });
        info!(client_id = %req.client_id, "agent registered, session token rotated");
        Ok((session_token, record))
    }

    /// Clears the in-memory slot for `client_id`; the persisted record is
    /// left alone — an unregister is a client-plane event, not a store
    /// deletion.
    pub async fn unregister(&self, client_id: &str) {
        if let Some(slot) = self.slots.write().await.remove(client_id) {
            if let Some(stream) = slot.stream {
                stream.cancel.cancel();
            }
        }
    }

    /// Validates a presented session token. On success, marks the agent
    /// connected if it was not already.
    pub async fn validate_session<S: Store>(&self, store: &S, client_id: &str, session_token: &str) -> Result<(), SessionError> {
        let mut guard = self.slots.write().await;
        let slot = guard.get_mut(client_id).ok_or(IdentityError::UnknownClient)?;
        if slot.record.session_token != session_token {
            return Err(SessionError::Identity(IdentityError::BadSession));
        }
        if !slot.record.connected {
            slot.record.connected = true;
            slot.record.last_seen = Utc::now();
            store.upsert_agent(slot.record.clone()).await?;
        }
        Ok(())
    }

    /// Installs `stream` as the live handle for `client_id`, cancelling
    /// and replacing any previous one. At most one active stream per
    /// client_id at a time.
    pub async fn attach_stream(&self, client_id: &str, tx: mpsc::Sender<Result<Command, Status>>) -> Result<CancellationToken, IdentityError> {
        let mut guard = self.slots.write().await;
        let slot = guard.get_mut(client_id).ok_or(IdentityError::UnknownClient)?;
        if let Some(previous) = slot.stream.take() {
            previous.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        slot.stream = Some(StreamHandle { tx, cancel: cancel.clone() });
        Ok(cancel)
    }

    /// Tears down the live stream for `client_id`, marking it disconnected
    /// in both the in-memory slot and the store.
    pub async fn detach<S: Store>(&self, store: &S, client_id: &str) -> Result<(), SessionError> {
        let mut guard = self.slots.write().await;
        let Some(slot) = guard.get_mut(client_id) else { return Ok(()) };
        if let Some(stream) = slot.stream.take() {
            stream.cancel.cancel();
        }
        slot.record.connected = false;
        slot.record.last_seen = Utc::now();
        store.upsert_agent(slot.record.clone()).await?;
        Ok(())
    }

    /// Copies out the current stream handle for `client_id`, if connected.
    /// Used by the command router to send without holding the table lock
    /// across the write: long-running I/O happens outside the lock by
    /// copying the stream handle first.
    pub async fn stream_handle(&self, client_id: &str) -> Option<StreamHandle> {
        self.slots.read().await.get(client_id).and_then(|s| s.stream.clone())
    }

    /// Copies out the agent record, for enrichment (e.g. the processor
    /// side of dispatch reading a client's registered name).
    pub async fn record(&self, client_id: &str) -> Option<AgentRecord> {
        self.slots.read().await.get(client_id).map(|s| s.record.clone())
    }

    /// Lists every currently-connected `client_id`, used by the registry
    /// client's health monitor to decide whether re-registration matters.
    pub async fn connected_client_ids(&self) -> Vec<String> {
        self.slots.read().await.iter().filter(|(_, s)| s.record.connected).map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use fleetd_store::MemoryStore;

    use super::*;

    fn req(client_id: &str) -> RegisterRequest {
        RegisterRequest {
            token: "good-token".into(),
            client_id: client_id.into(),
            name: "agent-1".into(),
            hostname: "host-1".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            kernel: "6.1".into(),
            projects: vec!["P1".into()],
            metadata: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn register_rejects_unknown_token() {
        let table = AgentSessionTable::new(vec!["good-token".into()]);
        let store = MemoryStore::new();
        let mut bad = req("c1");
        bad.token = "bad".into();
        let err = table.register(&store, bad).await.unwrap_err();
        assert!(matches!(err, SessionError::Identity(IdentityError::BadToken)));
    }

    #[tokio::test]
    async fn register_twice_rotates_token() {
        let table = AgentSessionTable::new(vec!["good-token".into()]);
        let store = MemoryStore::new();
        let (first, _) = table.register(&store, req("c1")).await.unwrap();
        let (second, _) = table.register(&store, req("c1")).await.unwrap();
        assert_ne!(first, second);

        assert!(table.validate_session(&store, "c1", &first.0).await.is_err());
        assert!(table.validate_session(&store, "c1", &second.0).await.is_ok());
    }

    #[tokio::test]
    async fn validate_session_unknown_client() {
        let table = AgentSessionTable::new(vec!["good-token".into()]);
        let store = MemoryStore::new();
        let err = table.validate_session(&store, "ghost", "whatever").await.unwrap_err();
        assert!(matches!(err, SessionError::Identity(IdentityError::UnknownClient)));
    }

    #[tokio::test]
    async fn attach_stream_preempts_previous() {
        let table = AgentSessionTable::new(vec!["good-token".into()]);
        let store = MemoryStore::new();
        table.register(&store, req("c1")).await.unwrap();

        let (tx1, _rx1) = mpsc::channel(1);
        let cancel1 = table.attach_stream("c1", tx1).await.unwrap();
        assert!(!cancel1.is_cancelled());

        let (tx2, _rx2) = mpsc::channel(1);
        let cancel2 = table.attach_stream("c1", tx2).await.unwrap();
        assert!(cancel1.is_cancelled());
        assert!(!cancel2.is_cancelled());
    }

    #[tokio::test]
    async fn detach_clears_stream_and_marks_disconnected() {
        let table = AgentSessionTable::new(vec!["good-token".into()]);
        let store = MemoryStore::new();
        table.register(&store, req("c1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = table.attach_stream("c1", tx).await.unwrap();

        table.detach(&store, "c1").await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(table.stream_handle("c1").await.is_none());
        assert!(!table.record("c1").await.unwrap().connected);
    }
}
