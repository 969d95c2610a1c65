//! Discovery callbacks and the delta discovery gRPC service (spec.md §4.D).
//!
//! Grounded on the original's `control-plane/server/callbacks.go` for the
//! callback semantics (`OnDeltaStreamOpen`/`OnDeltaStreamClosed`/
//! `OnStreamDeltaRequest`) and `helpers.go`'s `GetMetadata` for stream
//! metadata extraction (SPEC_FULL §10), with the stream-loop plumbing
//! itself following the `tonic::Streaming`-based ADS loop in the pack's
//! xDS reference server (per-request spawn, `ReceiverStream` for the
//! outbound half, structured `tracing` fields per message).

use std::sync::Arc;

use fleetd_composer::{compose, BodyValidator, ComposerError};
use fleetd_nodeid as nodeid;
use fleetd_proto::discovery::{
    discovery_service_server::DiscoveryService, DeltaDiscoveryRequest, DeltaDiscoveryResponse, Resource,
};
use fleetd_snapshot::{ResourceDelta, SnapshotCache};
use fleetd_store::{Store, StoreError};
use fleetd_tracker::ConnectionTracker;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("missing required stream metadata (nodeid)")]
    InvalidMetadata,

    #[error("malformed node-id")]
    InvalidNodeId,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Composer(#[from] ComposerError),
}

/// Per-stream metadata extracted once at stream open (SPEC_FULL §10's
/// `GetMetadata` helper, folded into a single constructor).
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    pub node_id: String,
    pub envoy_version: String,
    pub downstream_address: String,
    pub client_name: String,
    pub external_address: String,
}

impl StreamMetadata {
    /// Extracts stream metadata from incoming gRPC metadata. Returns
    /// `None` if `nodeid` is absent, matching spec.md §4.D: "If `nodeid`
    /// missing -> fail with `InvalidMetadata`".
    #[must_use]
    pub fn from_metadata(meta: &tonic::metadata::MetadataMap) -> Option<Self> {
        let get = |key: &str| meta.get(key).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
        let node_id = get("nodeid");
        if node_id.is_empty() {
            return None;
        }
        Some(Self {
            node_id,
            envoy_version: get("envoy-version"),
            downstream_address: get("downstream_address"),
            client_name: get("client_name"),
            external_address: get("x-envoy-external-address"),
        })
    }
}

/// The discovery callback set: the logic the discovery framework invokes
/// per stream, independent of the transport loop around it.
pub struct DiscoveryCallbacks<S, V> {
    pub snapshot: SnapshotCache,
    pub store: Arc<S>,
    pub validator: Arc<V>,
    pub tracker: ConnectionTracker,
}

impl<S: Store, V: BodyValidator> DiscoveryCallbacks<S, V> {
    pub fn new(snapshot: SnapshotCache, store: Arc<S>, validator: Arc<V>, tracker: ConnectionTracker) -> Self {
        Self { snapshot, store, validator, tracker }
    }

    /// `OnDeltaStreamOpen`. Composes and publishes a snapshot on first
    /// demand (the `CheckSnapshot` short-circuit lives in
    /// `SnapshotCache::get` itself: we simply skip composing if an entry
    /// already exists), then records the connection.
    pub async fn on_stream_open(&self, stream_id: i64, meta: &StreamMetadata) -> Result<(), DiscoveryError> {
        let (name, project, parsed_addr) = nodeid::decode(&meta.node_id);
        if name.is_empty() || project.is_empty() {
            return Err(DiscoveryError::InvalidNodeId);
        }

        if self.snapshot.get(&meta.node_id).await.is_none() {
            let addr = parsed_addr.as_deref().or_else(|| {
                if meta.downstream_address.is_empty() {
                    None
                } else {
                    Some(meta.downstream_address.as_str())
                }
            });
            let composed = compose(self.store.as_ref(), self.validator.as_ref(), &name, &project, addr).await?;
            self.snapshot.set(composed).await;
        }

        let address = if meta.downstream_address.is_empty() { &meta.external_address } else { &meta.downstream_address };
        self.tracker.track_up(&name, &project, &meta.node_id, stream_id, address, &meta.envoy_version, &meta.client_name);
        info!(node_id = %meta.node_id, stream_id, "stream opened");
        Ok(())
    }

    /// `OnDeltaStreamClosed`.
    pub async fn on_stream_closed(&self, stream_id: i64, node_id: &str) {
        let (name, project, _) = nodeid::decode(node_id);
        if name.is_empty() || project.is_empty() {
            warn!(node_id, "stream closed with malformed node-id, skipping tracker update");
            return;
        }
        self.tracker.track_down(&name, &project, node_id, stream_id);
        info!(node_id, stream_id, "stream closed");
    }

    /// `OnStreamDeltaRequest`. Only non-empty `error_detail` is persisted.
    pub fn on_stream_delta_request(&self, node_id: &str, type_url: &str, message: Option<&str>, response_nonce: &str) {
        let Some(message) = message else { return };
        let (name, project, _) = nodeid::decode(node_id);
        if name.is_empty() || project.is_empty() {
            return;
        }
        self.tracker.push_error(&name, &project, type_url, message, response_nonce);
    }
}

/// The tonic-facing service. Wraps [`DiscoveryCallbacks`] with the
/// per-stream transport loop.
pub struct DiscoveryServer<S, V> {
    callbacks: Arc<DiscoveryCallbacks<S, V>>,
}

impl<S, V> DiscoveryServer<S, V> {
    pub fn new(callbacks: Arc<DiscoveryCallbacks<S, V>>) -> Self {
        Self { callbacks }
    }
}

const OUTBOUND_CHANNEL_CAPACITY: usize = 16;

fn delta_to_response(delta: ResourceDelta, nonce: &str) -> DeltaDiscoveryResponse {
    DeltaDiscoveryResponse {
        type_url: format!("{:?}", delta.class),
        resources: delta
            .resources
            .into_iter()
            .map(|r| Resource { name: r.name, version: delta.version.clone(), body_json: r.body.to_string() })
            .collect(),
        removed_resources: vec![],
        system_version_info: delta.version,
        nonce: nonce.to_string(),
    }
}

#[tonic::async_trait]
impl<S, V> DiscoveryService for DiscoveryServer<S, V>
where
    S: Store + Send + Sync + 'static,
    V: BodyValidator + Send + Sync + 'static,
{
    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_aggregated_resources(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        let meta = StreamMetadata::from_metadata(request.metadata())
            .ok_or_else(|| Status::invalid_argument("missing required nodeid metadata"))?;

        let callbacks = self.callbacks.clone();
        let stream_id: i64 = rand::random();

        callbacks
            .on_stream_open(stream_id, &meta)
            .await
            .map_err(|err| Status::failed_precondition(err.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let mut in_stream = request.into_inner();
        let node_id = meta.node_id.clone();
        let mut watcher = callbacks.snapshot.watch(&node_id).await;

        let forward_tx = tx.clone();
        let forward_node_id = node_id.clone();
        tokio::spawn(async move {
            let mut nonce: u64 = 0;
            while let Some(delta) = watcher.recv().await {
                nonce += 1;
                debug!(node_id = %forward_node_id, class = ?delta.class, nonce, "forwarding resource delta");
                if forward_tx.send(Ok(delta_to_response(delta, &nonce.to_string()))).await.is_err() {
                    break;
                }
            }
        });

        let loop_callbacks = callbacks.clone();
        let loop_node_id = node_id.clone();
        tokio::spawn(async move {
            loop {
                match in_stream.message().await {
                    Ok(Some(req)) => {
                        if let Some(detail) = req.error_detail {
                            loop_callbacks.on_stream_delta_request(&loop_node_id, &req.type_url, Some(&detail.message), &req.response_nonce);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(node_id = %loop_node_id, error = %err, "discovery stream read error");
                        break;
                    }
                }
            }
            loop_callbacks.on_stream_closed(stream_id, &loop_node_id).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use fleetd_composer::NoopValidator;
    use fleetd_store::MemoryStore;
    use std::collections::BTreeMap as Map;

    use super::*;

    fn listener_record() -> fleetd_types::ResourceRecord {
        fleetd_types::ResourceRecord {
            id: fleetd_types::ResourceId("L1".into()),
            general: fleetd_types::GeneralMeta {
                name: "L1".into(),
                version: "v1".into(),
                r#type: "listener".into(),
                gtype: "type.googleapis.com/envoy.config.listener.v3.Listener".into(),
                canonical_name: "L1".into(),
                category: "listener".into(),
                collection: fleetd_types::Collection::Listeners,
                project: "P1".into(),
                permissions: vec![],
                managed: false,
                metadata: Map::new(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                typed_config: vec![],
                config_discovery: vec![],
            },
            resource: fleetd_types::ResourceBody { version: "v1".into(), resource: serde_json::json!({}) },
        }
    }

    #[tokio::test]
    async fn from_metadata_requires_nodeid() {
        let meta = tonic::metadata::MetadataMap::new();
        assert!(StreamMetadata::from_metadata(&meta).is_none());
    }

    #[tokio::test]
    async fn on_stream_open_composes_once_and_tracks_up() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_resource(listener_record()).await.unwrap();
        let snapshot = SnapshotCache::new();
        let tracker = ConnectionTracker::spawn(store.clone());
        let callbacks = DiscoveryCallbacks::new(snapshot.clone(), store.clone(), Arc::new(NoopValidator), tracker);

        let meta = StreamMetadata {
            node_id: "L1::P1".into(),
            envoy_version: "1.30".into(),
            downstream_address: String::new(),
            client_name: "agent-1".into(),
            external_address: "10.0.0.1".into(),
        };
        callbacks.on_stream_open(1, &meta).await.unwrap();
        assert!(snapshot.get("L1::P1").await.is_some());
        assert_eq!(callbacks.tracker.count("L1::P1"), 1);

        // A second open for the same node-id does not re-compose (no store
        // mutation needed to prove this directly; absence of a NotFound
        // error on a now-removed listener would, but simpler: confirm the
        // snapshot didn't change identity).
        let snap_before = snapshot.get("L1::P1").await;
        callbacks.on_stream_open(2, &meta).await.unwrap();
        assert_eq!(snapshot.get("L1::P1").await, snap_before);
    }

    #[tokio::test]
    async fn on_stream_open_rejects_malformed_node_id() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConnectionTracker::spawn(store.clone());
        let callbacks = DiscoveryCallbacks::new(SnapshotCache::new(), store, Arc::new(NoopValidator), tracker);
        let meta = StreamMetadata {
            node_id: "malformed".into(),
            envoy_version: String::new(),
            downstream_address: String::new(),
            client_name: String::new(),
            external_address: String::new(),
        };
        let err = callbacks.on_stream_open(1, &meta).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidNodeId));
    }
}
