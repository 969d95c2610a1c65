//! The `Store` trait boundary: every persisted collection the control plane
//! reads or writes, modeled as an async trait rather than a concrete
//! database client.
//!
//! spec.md's Non-goals exclude a real store implementation (REST admin
//! surface, document schemas beyond what this core reads, bootstrap
//! templating, and so on are external collaborators) — this crate defines
//! only the boundary those collaborators sit behind, the way
//! `kimberlite-storage`/`kimberlite-query` separate the query surface from
//! any one backing engine. An in-memory implementation is included for use
//! in the rest of the workspace's unit tests.

use std::collections::BTreeMap;
use std::future::Future;

use fleetd_types::{AgentRecord, Collection, EnvoyRecord, ResourceRecord, ServiceBinding};
use thiserror::Error;

/// Errors a [`Store`] implementation can surface.
///
/// Matches spec.md §7's write-path/persistence taxonomy: `NotFound` and
/// `NameAlreadyExists` are meaningful to callers; `StoreError` is an opaque
/// catch-all that is never shown to end users verbatim.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {collection:?}/{name}/{project}")]
    NotFound { collection: Collection, name: String, project: String },

    #[error("name already exists: {collection:?}/{name}/{project}/{version}")]
    NameAlreadyExists { collection: Collection, name: String, project: String, version: String },

    #[error("no admin port available in [33100, 39999] for {name}/{project}")]
    NoAdminPortAvailable { name: String, project: String },

    #[error(
        "listener {name}/{project} cannot change managed/unmanaged semantics while it has \
         existing service bindings"
    )]
    MixedManagedSemantics { name: String, project: String },

    #[error("store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lookup key for a resource record: `(collection, name, project)`.
///
/// A record's full natural key also carries `version` (see
/// [`fleetd_types::ResourceRecord::natural_key`]); lookups by current value
/// address the latest version within this triple, matching every usage in
/// spec.md's component descriptions ("Load the listener record...").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceKey {
    pub collection: Collection,
    pub name: String,
    pub project: String,
}

impl ResourceKey {
    pub fn new(collection: Collection, name: impl Into<String>, project: impl Into<String>) -> Self {
        Self { collection, name: name.into(), project: project.into() }
    }
}

/// The persisted-document boundary consumed by the rest of the workspace.
///
/// Every method is `async fn` (edition 2024 trait support); implementations
/// are expected to be `Send + Sync` and cheaply `Clone`-able handles over a
/// real backing store, the way a database connection pool is.
pub trait Store: Send + Sync {
    /// Loads the current record for `key`, per spec.md §4.C step 1
    /// ("Load the listener record; fail with `NotFound` if missing").
    fn get_resource(&self, key: &ResourceKey) -> impl Future<Output = StoreResult<ResourceRecord>> + Send;

    /// Upserts a resource record, enforcing the `(name, project, version)`
    /// uniqueness invariant within its collection (spec.md §6).
    fn upsert_resource(&self, record: ResourceRecord) -> impl Future<Output = StoreResult<()>> + Send;

    /// Reads the connectivity record for a node, if one exists.
    fn get_envoy_record(
        &self,
        name: &str,
        project: &str,
    ) -> impl Future<Output = StoreResult<Option<EnvoyRecord>>> + Send;

    /// Upserts a node's connectivity record (component E's tracker drain
    /// loop is the primary writer here).
    fn upsert_envoy_record(&self, record: EnvoyRecord) -> impl Future<Output = StoreResult<()>> + Send;

    /// Deletes a node's connectivity record entirely. Used when an
    /// undeploy empties a service binding's client list (SPEC_FULL §10).
    fn delete_envoy_record(&self, name: &str, project: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Reads an agent record by `client_id`.
    fn get_agent(&self, client_id: &str) -> impl Future<Output = StoreResult<Option<AgentRecord>>> + Send;

    /// Upserts an agent record by `client_id` (register, and every
    /// last-seen/connected-flag update thereafter).
    fn upsert_agent(&self, record: AgentRecord) -> impl Future<Output = StoreResult<()>> + Send;

    /// Reads the service binding for a managed listener, if one exists.
    fn get_service_binding(
        &self,
        name: &str,
        project: &str,
    ) -> impl Future<Output = StoreResult<Option<ServiceBinding>>> + Send;

    /// Upserts a service binding. Returns
    /// [`StoreError::MixedManagedSemantics`] if the listener this binding
    /// names is currently unmanaged and already has bindings recorded under
    /// a different admin port scheme — see DESIGN.md's Open Question #3.
    fn upsert_service_binding(&self, binding: ServiceBinding) -> impl Future<Output = StoreResult<()>> + Send;

    /// Deletes a service binding outright (used alongside
    /// `delete_envoy_record` when undeploy empties the client list).
    fn delete_service_binding(&self, name: &str, project: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Allocates the next admin port for `(name, project)`: `max + 1`
    /// within `[33100, 39999]` on first need, persisted in `admin_ports`.
    /// Exhaustion at 39999 returns [`StoreError::NoAdminPortAvailable`]
    /// without inserting anything (spec.md §8 boundary behavior).
    fn next_admin_port(&self, name: &str, project: &str) -> impl Future<Output = StoreResult<u16>> + Send;

    /// Lists every resource in `collection` whose body references `(name,
    /// project)` as an upstream dependency — the query the dependency
    /// walker (component M) uses to find listeners affected by a change.
    fn find_dependents(
        &self,
        collection: Collection,
        name: &str,
        project: &str,
    ) -> impl Future<Output = StoreResult<Vec<ResourceRecord>>> + Send;
}

pub const ADMIN_PORT_MIN: u16 = 33_100;
pub const ADMIN_PORT_MAX: u16 = 39_999;

/// An in-memory [`Store`] for use in the rest of the workspace's unit
/// tests. Not exposed as a production backend: spec.md's Non-goals keep
/// the real persistence engine out of scope for this core.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    resources: BTreeMap<(Collection, String, String), ResourceRecord>,
    envoys: BTreeMap<(String, String), EnvoyRecord>,
    agents: BTreeMap<String, AgentRecord>,
    bindings: BTreeMap<(String, String), ServiceBinding>,
    admin_ports: BTreeMap<(String, String), u16>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn get_resource(&self, key: &ResourceKey) -> StoreResult<ResourceRecord> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .resources
            .get(&(key.collection, key.name.clone(), key.project.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: key.collection,
                name: key.name.clone(),
                project: key.project.clone(),
            })
    }

    async fn upsert_resource(&self, record: ResourceRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let key = (
            record.general.collection,
            record.general.name.clone(),
            record.general.project.clone(),
        );
        if record.general.collection == Collection::Listeners {
            if let Some(existing) = inner.resources.get(&key) {
                if existing.general.managed != record.general.managed {
                    let has_bindings = inner
                        .bindings
                        .get(&(record.general.name.clone(), record.general.project.clone()))
                        .is_some_and(|b| !b.is_empty());
                    if has_bindings {
                        return Err(StoreError::MixedManagedSemantics {
                            name: record.general.name,
                            project: record.general.project,
                        });
                    }
                }
            }
        }
        if let Some(existing) = inner.resources.get(&key) {
            // Same (collection, name, project) and the same version is a
            // collision between two distinct records; a version bump
            // (version differs) is an update, not a collision.
            if existing.general.version == record.general.version && existing.id != record.id {
                return Err(StoreError::NameAlreadyExists {
                    collection: record.general.collection,
                    name: record.general.name,
                    project: record.general.project,
                    version: record.general.version,
                });
            }
        }
        inner.resources.insert(key, record);
        Ok(())
    }

    async fn get_envoy_record(&self, name: &str, project: &str) -> StoreResult<Option<EnvoyRecord>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.envoys.get(&(name.to_string(), project.to_string())).cloned())
    }

    async fn upsert_envoy_record(&self, record: EnvoyRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.envoys.insert((record.name.clone(), record.project.clone()), record);
        Ok(())
    }

    async fn delete_envoy_record(&self, name: &str, project: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.envoys.remove(&(name.to_string(), project.to_string()));
        Ok(())
    }

    async fn get_agent(&self, client_id: &str) -> StoreResult<Option<AgentRecord>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.agents.get(client_id).cloned())
    }

    async fn upsert_agent(&self, record: AgentRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.agents.insert(record.client_id.clone(), record);
        Ok(())
    }

    async fn get_service_binding(&self, name: &str, project: &str) -> StoreResult<Option<ServiceBinding>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.bindings.get(&(name.to_string(), project.to_string())).cloned())
    }

    async fn upsert_service_binding(&self, binding: ServiceBinding) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.bindings.insert((binding.name.clone(), binding.project.clone()), binding);
        Ok(())
    }

    async fn delete_service_binding(&self, name: &str, project: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.bindings.remove(&(name.to_string(), project.to_string()));
        Ok(())
    }

    async fn next_admin_port(&self, name: &str, project: &str) -> StoreResult<u16> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let key = (name.to_string(), project.to_string());
        let current = inner.admin_ports.get(&key).copied().unwrap_or(ADMIN_PORT_MIN - 1);
        if current >= ADMIN_PORT_MAX {
            return Err(StoreError::NoAdminPortAvailable { name: name.to_string(), project: project.to_string() });
        }
        let next = current.max(ADMIN_PORT_MIN - 1) + 1;
        inner.admin_ports.insert(key, next);
        Ok(next)
    }

    async fn find_dependents(
        &self,
        collection: Collection,
        name: &str,
        project: &str,
    ) -> StoreResult<Vec<ResourceRecord>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner
            .resources
            .values()
            .filter(|r| {
                r.general.collection == collection
                    && r.general.project == project
                    && r.general
                        .typed_config
                        .iter()
                        .chain(r.general.config_discovery.iter())
                        .any(|c| c.name == name)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use std::collections::BTreeMap as Map;

    use super::*;

    fn listener(name: &str, project: &str, version: &str) -> ResourceRecord {
        ResourceRecord {
            id: fleetd_types::ResourceId(format!("{name}-{version}")),
            general: fleetd_types::GeneralMeta {
                name: name.into(),
                version: version.into(),
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
            resource: fleetd_types::ResourceBody { version: version.into(), resource: serde_json::json!({}) },
        }
    }

    #[tokio::test]
    async fn get_resource_not_found() {
        let store = MemoryStore::new();
        let err = store.get_resource(&ResourceKey::new(Collection::Listeners, "L1", "P1")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = MemoryStore::new();
        store.upsert_resource(listener("L1", "P1", "v1")).await.unwrap();
        let got = store.get_resource(&ResourceKey::new(Collection::Listeners, "L1", "P1")).await.unwrap();
        assert_eq!(got.natural_key(), ("L1", "P1", "v1"));
    }

    #[tokio::test]
    async fn upsert_rejects_distinct_id_with_identical_natural_key() {
        let store = MemoryStore::new();
        store.upsert_resource(listener("L1", "P1", "v1")).await.unwrap();

        let mut colliding = listener("L1", "P1", "v1");
        colliding.id = fleetd_types::ResourceId("a-different-id".into());
        let err = store.upsert_resource(colliding).await.unwrap_err();
        assert!(matches!(err, StoreError::NameAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn upsert_allows_version_bump_as_an_update() {
        let store = MemoryStore::new();
        store.upsert_resource(listener("L1", "P1", "v1")).await.unwrap();
        store.upsert_resource(listener("L1", "P1", "v2")).await.unwrap();

        let got = store.get_resource(&ResourceKey::new(Collection::Listeners, "L1", "P1")).await.unwrap();
        assert_eq!(got.natural_key(), ("L1", "P1", "v2"));
    }

    #[tokio::test]
    async fn admin_port_allocates_sequentially_and_exhausts() {
        let store = MemoryStore::new();
        let first = store.next_admin_port("L1", "P1").await.unwrap();
        assert_eq!(first, ADMIN_PORT_MIN);
        let second = store.next_admin_port("L1", "P1").await.unwrap();
        assert_eq!(second, ADMIN_PORT_MIN + 1);

        // A different (listener, project) scope starts over.
        let other = store.next_admin_port("L2", "P1").await.unwrap();
        assert_eq!(other, ADMIN_PORT_MIN);

        {
            let mut inner = store.inner.lock().unwrap();
            inner.admin_ports.insert(("L3".into(), "P1".into()), ADMIN_PORT_MAX);
        }
        let err = store.next_admin_port("L3", "P1").await.unwrap_err();
        assert!(matches!(err, StoreError::NoAdminPortAvailable { .. }));
    }

    #[tokio::test]
    async fn flipping_managed_semantics_rejected_with_existing_bindings() {
        let store = MemoryStore::new();
        store.upsert_resource(listener("L1", "P1", "v1")).await.unwrap();
        let mut binding = ServiceBinding { name: "L1".into(), project: "P1".into(), admin_port: 33100, clients: vec![] };
        binding.add_client("c1".into(), "10.0.0.1:443".into());
        store.upsert_service_binding(binding).await.unwrap();

        let mut managed = listener("L1", "P1", "v2");
        managed.general.managed = true;
        let err = store.upsert_resource(managed).await.unwrap_err();
        assert!(matches!(err, StoreError::MixedManagedSemantics { .. }));
    }

    #[tokio::test]
    async fn service_binding_delete_after_empty() {
        let store = MemoryStore::new();
        let mut binding = ServiceBinding { name: "L1".into(), project: "P1".into(), admin_port: 33100, clients: vec![] };
        binding.add_client("c1".into(), "10.0.0.1:443".into());
        store.upsert_service_binding(binding.clone()).await.unwrap();

        binding.remove_client("c1");
        assert!(binding.is_empty());
        store.delete_service_binding("L1", "P1").await.unwrap();
        assert!(store.get_service_binding("L1", "P1").await.unwrap().is_none());
    }
}
