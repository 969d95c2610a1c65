//! Connection tracker (spec.md §4.E).
//!
//! Discovery callbacks must return quickly, so the live per-node counter
//! lives under a single mutex while the store write that follows goes
//! through a bounded channel drained by a dedicated task — the same
//! split the original keeps between `EnvoyConnTracker`'s in-memory
//! `Counter` map and its `dbOpChan`-fed `processDBOperations` goroutine
//! (`control-plane/envoys/base.go`, `tracker.go`).
//!
//! We accept eventual consistency between the live counter and the
//! persisted record: a crash between `track_up` and the drain loop
//! picking up its op loses that one update, never the stream itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use fleetd_store::Store;
use fleetd_types::{DownstreamEntry, EnvoyRecord, ProtocolErrorEvent};
use tokio::sync::mpsc;
use tracing::warn;

/// Bound on the per-node error list retained in a persisted [`EnvoyRecord`]
/// (spec.md §4.D: "bounded to the most recent N per node (N = 50)").
pub const MAX_ERRORS_PER_NODE: usize = 50;

/// Capacity of the tracker's persistence-op channel (spec.md §4.E:
/// "`ops_channel` buffered to 1024 at least").
const OPS_CHANNEL_CAPACITY: usize = 1024;

/// Timeout for a single store write performed by the drain loop (spec.md
/// §4.E: "performs store writes with a 10-second timeout per op").
const OP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Identity {
    stream_id: i64,
    address: String,
    envoy_version: String,
    client_name: String,
}

#[derive(Debug, Clone)]
enum Op {
    Up { name: String, project: String, identity: Identity },
    Down { name: String, project: String, stream_id: i64 },
    Error { name: String, project: String, event: ProtocolErrorEvent },
}

/// The process-local live counter plus a handle to the persistence drain
/// loop's input channel. Cheaply `Clone`-able: cloning shares both the
/// counter map and the channel sender.
#[derive(Clone)]
pub struct ConnectionTracker {
    counters: std::sync::Arc<Mutex<HashMap<String, i64>>>,
    tx: mpsc::Sender<Op>,
}

impl ConnectionTracker {
    /// Spawns the drain loop against `store` and returns a tracker handle.
    /// The drain loop runs until every `ConnectionTracker` clone (and this
    /// returned handle) is dropped, at which point the channel closes and
    /// the spawned task exits.
    pub fn spawn<S>(store: std::sync::Arc<S>) -> Self
    where
        S: Store + 'static,
    {
        let (tx, rx) = mpsc::channel(OPS_CHANNEL_CAPACITY);
        let tracker = Self { counters: std::sync::Arc::new(Mutex::new(HashMap::new())), tx };
        tokio::spawn(drain_loop(store, rx));
        tracker
    }

    /// Increments the live counter for `node_id` and enqueues a
    /// persistence update. Returns the new counter value.
    pub fn track_up(
        &self,
        name: &str,
        project: &str,
        node_id: &str,
        stream_id: i64,
        address: &str,
        envoy_version: &str,
        client_name: &str,
    ) -> i64 {
        let value = {
            let mut guard = self.counters.lock().expect("lock poisoned");
            let entry = guard.entry(node_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let op = Op::Up {
            name: name.to_string(),
            project: project.to_string(),
            identity: Identity {
                stream_id,
                address: address.to_string(),
                envoy_version: envoy_version.to_string(),
                client_name: client_name.to_string(),
            },
        };
        self.send(op);
        value
    }

    /// Decrements the live counter for `node_id`, saturating at 0, and
    /// enqueues a persistence update. Returns the new counter value.
    pub fn track_down(&self, name: &str, project: &str, node_id: &str, stream_id: i64) -> i64 {
        let value = {
            let mut guard = self.counters.lock().expect("lock poisoned");
            let entry = guard.entry(node_id.to_string()).or_insert(0);
            if *entry > 0 {
                *entry -= 1;
            }
            *entry
        };
        self.send(Op::Down { name: name.to_string(), project: project.to_string(), stream_id });
        value
    }

    /// Reads the live counter for `node_id` without touching the store.
    pub fn count(&self, node_id: &str) -> i64 {
        self.counters.lock().expect("lock poisoned").get(node_id).copied().unwrap_or(0)
    }

    /// Appends a protocol-level error event, bounded to the most recent
    /// [`MAX_ERRORS_PER_NODE`] per node (spec.md §4.D).
    pub fn push_error(&self, name: &str, project: &str, type_url: &str, message: &str, response_nonce: &str) {
        let event = ProtocolErrorEvent {
            type_url: type_url.to_string(),
            message: message.to_string(),
            response_nonce: response_nonce.to_string(),
            occurred_at: Utc::now(),
        };
        self.send(Op::Error { name: name.to_string(), project: project.to_string(), event });
    }

    fn send(&self, op: Op) {
        if self.tx.try_send(op).is_err() {
            warn!("tracker ops channel full or closed, dropping persistence update");
        }
    }
}

async fn drain_loop<S: Store>(store: std::sync::Arc<S>, mut rx: mpsc::Receiver<Op>) {
    while let Some(op) = rx.recv().await {
        let result = tokio::time::timeout(OP_TIMEOUT, apply(store.as_ref(), op)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "tracker drain op failed, dropping"),
            Err(_) => warn!("tracker drain op timed out after {:?}, dropping", OP_TIMEOUT),
        }
    }
}

async fn apply<S: Store>(store: &S, op: Op) -> Result<(), fleetd_store::StoreError> {
    match op {
        Op::Up { name, project, identity } => {
            let mut record = store
                .get_envoy_record(&name, &project)
                .await?
                .unwrap_or_else(|| EnvoyRecord { name: name.clone(), project: project.clone(), downstreams: vec![], status: fleetd_types::ConnectionStatus::Offline, errors: vec![] });

            match record.downstreams.iter_mut().find(|d| d.stream_id == identity.stream_id) {
                Some(entry) => {
                    entry.connected = true;
                    entry.address = identity.address;
                    entry.envoy_version = identity.envoy_version;
                    entry.client_name = identity.client_name;
                    entry.last_seen = Utc::now();
                }
                None => record.downstreams.push(DownstreamEntry {
                    stream_id: identity.stream_id,
                    address: identity.address,
                    envoy_version: identity.envoy_version,
                    client_name: identity.client_name,
                    connected: true,
                    last_seen: Utc::now(),
                }),
            }
            record.recompute_status();
            store.upsert_envoy_record(record).await
        }
        Op::Down { name, project, stream_id } => {
            let Some(mut record) = store.get_envoy_record(&name, &project).await? else { return Ok(()) };
            if let Some(entry) = record.downstreams.iter_mut().find(|d| d.stream_id == stream_id) {
                entry.connected = false;
                entry.last_seen = Utc::now();
            }
            record.recompute_status();
            store.upsert_envoy_record(record).await
        }
        Op::Error { name, project, event } => {
            let Some(mut record) = store.get_envoy_record(&name, &project).await? else { return Ok(()) };
            record.errors.push(event);
            if record.errors.len() > MAX_ERRORS_PER_NODE {
                let overflow = record.errors.len() - MAX_ERRORS_PER_NODE;
                record.errors.drain(0..overflow);
            }
            store.upsert_envoy_record(record).await
        }
    }
}
