//! Poke bridge (spec.md §4.L): the RPC pair that lets one controller
//! replica ask the replica owning a listener's discovery stream to
//! recompose and republish its snapshot, plus read-only snapshot
//! introspection for admin surfaces.
//!
//! Grounded on the original's `control-plane/server/bridge/poke.go`
//! (`PokeService.Poke` loads the listener, calls `GenerateSnapshot`, sets it
//! into the snapshot cache, and `getAllResourcesFromListener`'s
//! read-only-introspection shape for `GetSnapshotKeys`/`GetSnapshotResources`)
//! and `controller/bridge/poke.go` (`PokeNode`'s client-side call shape,
//! which [`PokeClient`] mirrors as the remote half of the [`Poker`]
//! boundary dependency-walking (component M) dispatches through).

use std::future::Future;
use std::sync::Arc;

use fleetd_composer::{compose, BodyValidator, ComposerError};
use fleetd_proto::poke::poke_service_client::PokeServiceClient;
use fleetd_proto::poke::poke_service_server::PokeService;
use fleetd_proto::poke::{
    GetSnapshotKeysRequest, GetSnapshotKeysResponse, GetSnapshotResourcesRequest, GetSnapshotResourcesResponse, PokeRequest, PokeResponse,
};
use fleetd_snapshot::SnapshotCache;
use fleetd_store::{Store, StoreError};
use thiserror::Error;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PokeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Composer(#[from] ComposerError),
}

pub type PokeResult<T> = Result<T, PokeError>;

/// The local-or-remote poke boundary the dependency walker (component M)
/// dispatches through, without caring which replica owns the listener's
/// snapshot.
pub trait Poker: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn poke(&self, name: &str, project: &str, downstream_address: Option<&str>) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Business logic behind the `PokeService` RPCs, independent of the tonic
/// transport wrapper so it can also serve as the in-process [`Poker`] for a
/// dependency walker running in the same replica as the snapshot cache.
pub struct PokeHandler<S, V> {
    store: Arc<S>,
    validator: Arc<V>,
    snapshot: SnapshotCache,
}

impl<S: Store, V: BodyValidator> PokeHandler<S, V> {
    #[must_use]
    pub fn new(store: Arc<S>, validator: Arc<V>, snapshot: SnapshotCache) -> Self {
        Self { store, validator, snapshot }
    }

    /// Recomposes `(name, project, downstream_address?)` and republishes it
    /// to the snapshot cache (spec.md §4.L: "invoke composer; publish to
    /// cache"). The cache's own version comparison makes repeated pokes for
    /// an unchanged listener a no-op beyond the recompute.
    pub async fn poke(&self, name: &str, project: &str, downstream_address: Option<&str>) -> PokeResult<String> {
        let snapshot = compose(self.store.as_ref(), self.validator.as_ref(), name, project, downstream_address).await?;
        let node_id = snapshot.node_id.clone();
        self.snapshot.set(snapshot).await;
        info!(node_id, "poke republished snapshot");
        Ok(format!("poke successful for {node_id}"))
    }

    /// Every node-id currently held in the snapshot cache.
    pub async fn snapshot_keys(&self) -> Vec<String> {
        self.snapshot.keys().await
    }

    /// The JSON-encoded snapshot for `node_id`, if the cache holds one.
    pub async fn snapshot_resources(&self, node_id: &str) -> Option<String> {
        let snapshot = self.snapshot.get(node_id).await?;
        Some(serde_json::json!({
            "node_id": snapshot.node_id,
            "version": snapshot.version,
            "classes": snapshot.classes.into_iter().map(|(class, class_snapshot)| {
                (format!("{class:?}"), serde_json::json!({
                    "version": class_snapshot.version,
                    "resources": class_snapshot.resources,
                }))
            }).collect::<serde_json::Map<_, _>>(),
        }).to_string())
    }
}

impl<S: Store, V: BodyValidator> Poker for PokeHandler<S, V> {
    type Error = PokeError;

    async fn poke(&self, name: &str, project: &str, downstream_address: Option<&str>) -> PokeResult<()> {
        PokeHandler::poke(self, name, project, downstream_address).await.map(|_| ())
    }
}

/// The tonic-facing wrapper around [`PokeHandler`], co-exposed on the
/// discovery gRPC port per spec.md §6.
pub struct PokeServer<S, V> {
    handler: Arc<PokeHandler<S, V>>,
}

impl<S, V> PokeServer<S, V> {
    #[must_use]
    pub fn new(handler: Arc<PokeHandler<S, V>>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<S, V> PokeService for PokeServer<S, V>
where
    S: Store + Send + Sync + 'static,
    V: BodyValidator + Send + Sync + 'static,
{
    async fn poke(&self, request: Request<PokeRequest>) -> Result<Response<PokeResponse>, Status> {
        let req = request.into_inner();
        let addr = if req.downstream_address.is_empty() { None } else { Some(req.downstream_address.as_str()) };
        match self.handler.poke(&req.name, &req.project, addr).await {
            Ok(message) => Ok(Response::new(PokeResponse { success: true, message, error: String::new() })),
            Err(err) => {
                warn!(name = %req.name, project = %req.project, error = %err, "poke failed");
                Ok(Response::new(PokeResponse { success: false, message: String::new(), error: err.to_string() }))
            }
        }
    }

    async fn get_snapshot_keys(&self, _request: Request<GetSnapshotKeysRequest>) -> Result<Response<GetSnapshotKeysResponse>, Status> {
        Ok(Response::new(GetSnapshotKeysResponse { node_ids: self.handler.snapshot_keys().await }))
    }

    async fn get_snapshot_resources(&self, request: Request<GetSnapshotResourcesRequest>) -> Result<Response<GetSnapshotResourcesResponse>, Status> {
        let node_id = request.into_inner().node_id;
        match self.handler.snapshot_resources(&node_id).await {
            Some(snapshot_json) => Ok(Response::new(GetSnapshotResourcesResponse { found: true, snapshot_json })),
            None => Ok(Response::new(GetSnapshotResourcesResponse { found: false, snapshot_json: String::new() })),
        }
    }
}

#[derive(Debug, Error)]
pub enum PokeClientError {
    #[error("failed to dial poke bridge at {address}: {source}")]
    Connect { address: String, source: tonic::transport::Error },

    #[error("poke rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("remote replica rejected poke for {name}/{project}: {reason}")]
    Rejected { name: String, project: String, reason: String },
}

/// The remote half of [`Poker`]: calls another replica's `PokeService` over
/// gRPC (the original's `controller/bridge/poke.go`'s `PokeNode`).
#[derive(Clone)]
pub struct PokeClient {
    client: PokeServiceClient<Channel>,
}

impl PokeClient {
    pub async fn connect(address: &str) -> Result<Self, PokeClientError> {
        let channel = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .map_err(|source| PokeClientError::Connect { address: address.to_string(), source })?
            .connect()
            .await
            .map_err(|source| PokeClientError::Connect { address: address.to_string(), source })?;
        Ok(Self { client: PokeServiceClient::new(channel) })
    }
}

impl Poker for PokeClient {
    type Error = PokeClientError;

    async fn poke(&self, name: &str, project: &str, downstream_address: Option<&str>) -> Result<(), PokeClientError> {
        let mut client = self.client.clone();
        let request = PokeRequest { name: name.to_string(), project: project.to_string(), downstream_address: downstream_address.unwrap_or_default().to_string() };
        let response = client.poke(request).await?.into_inner();
        if !response.success {
            return Err(PokeClientError::Rejected { name: name.to_string(), project: project.to_string(), reason: response.error });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use chrono::Utc;
    use fleetd_composer::NoopValidator;
    use fleetd_store::MemoryStore;
    use fleetd_types::{Collection, GeneralMeta, ResourceBody, ResourceId, ResourceRecord};

    use super::*;

    fn listener(name: &str, project: &str) -> ResourceRecord {
        ResourceRecord {
            id: ResourceId(format!("{name}-id")),
            general: GeneralMeta {
                name: name.into(),
                version: "v1".into(),
                r#type: "listener".into(),
                gtype: "type.googleapis.com/envoy.config.listener.v3.Listener".into(),
                canonical_name: name.into(),
                category: "listener".into(),
                collection: Collection::Listeners,
                project: project.into(),
                permissions: vec![],
                managed: false,
                metadata: Map::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                typed_config: vec![],
                config_discovery: vec![],
            },
            resource: ResourceBody { version: "v1".into(), resource: serde_json::json!({}) },
        }
    }

    #[tokio::test]
    async fn poke_composes_and_publishes_to_cache() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_resource(listener("L1", "P1")).await.unwrap();
        let snapshot = SnapshotCache::new();
        let handler = PokeHandler::new(store, Arc::new(NoopValidator), snapshot.clone());

        let message = handler.poke("L1", "P1", None).await.unwrap();
        assert!(message.contains("L1::P1"));
        assert!(snapshot.get("L1::P1").await.is_some());
    }

    #[tokio::test]
    async fn poke_on_missing_listener_surfaces_not_found() {
        let store = Arc::new(MemoryStore::new());
        let handler = PokeHandler::new(store, Arc::new(NoopValidator), SnapshotCache::new());
        let err = handler.poke("missing", "P1", None).await.unwrap_err();
        assert!(matches!(err, PokeError::Composer(ComposerError::Store(StoreError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn snapshot_keys_and_resources_reflect_published_snapshots() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_resource(listener("L1", "P1")).await.unwrap();
        let snapshot = SnapshotCache::new();
        let handler = PokeHandler::new(store, Arc::new(NoopValidator), snapshot);

        assert!(handler.snapshot_keys().await.is_empty());
        handler.poke("L1", "P1", None).await.unwrap();

        let keys = handler.snapshot_keys().await;
        assert_eq!(keys, vec!["L1::P1".to_string()]);

        let resources = handler.snapshot_resources("L1::P1").await.unwrap();
        assert!(resources.contains("\"version\":\"v1\""));
        assert!(handler.snapshot_resources("missing::node").await.is_none());
    }

    #[tokio::test]
    async fn poker_trait_is_object_agnostic_between_handler_and_client() {
        async fn poke_via<P: Poker>(p: &P) -> Result<(), P::Error> {
            p.poke("L1", "P1", None).await
        }

        let store = Arc::new(MemoryStore::new());
        store.upsert_resource(listener("L1", "P1")).await.unwrap();
        let handler = PokeHandler::new(store, Arc::new(NoopValidator), SnapshotCache::new());
        poke_via(&handler).await.unwrap();
    }
}
