//! Process-wide snapshot cache (spec.md §4.B).
//!
//! Maps a node-id to its current versioned resource set and fans out
//! deltas to watchers when a `set` changes a class's version. Grounded on
//! the `SnapshotCache`/notify-on-update shape of the xDS reference server
//! in the pack (`batata-mesh`'s `crate::snapshot::SnapshotCache`) and on the
//! original `control-plane/server/snapshot/snopshot.go` wrapper around
//! go-control-plane's cache, translated from its callback-driven API into
//! an explicit watcher-channel registry idiomatic for async Rust.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetd_types::{ResourceClass, TypedResource};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

/// One resource class's contribution to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassSnapshot {
    pub version: String,
    pub resources: Vec<TypedResource>,
}

/// A fully composed snapshot for one node-id.
///
/// Identity is `(node_id, version)` per spec.md §4.B; `version` here is the
/// snapshot-wide version (the listener's `resource.version`, per 4.C step
/// 5), while each class additionally carries its own version so `set` can
/// detect which classes actually changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub node_id: String,
    pub version: String,
    pub classes: BTreeMap<ResourceClass, ClassSnapshot>,
}

impl Snapshot {
    #[must_use]
    pub fn new(node_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), version: version.into(), classes: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_class(mut self, class: ResourceClass, version: impl Into<String>, resources: Vec<TypedResource>) -> Self {
        self.classes.insert(class, ClassSnapshot { version: version.into(), resources });
        self
    }
}

/// A delta delivered to a watcher: one resource class's resources, in the
/// order they were composed, at the new snapshot version.
#[derive(Debug, Clone)]
pub struct ResourceDelta {
    pub node_id: String,
    pub class: ResourceClass,
    pub version: String,
    pub resources: Vec<TypedResource>,
}

type WatcherTx = mpsc::Sender<ResourceDelta>;

#[derive(Default)]
struct Entry {
    snapshot: Snapshot,
    watchers: Vec<WatcherTx>,
}

/// The process-wide snapshot cache.
///
/// Cheaply cloneable: internally an `Arc<RwLock<_>>`, the way the teacher's
/// shared async state (`kimberlite-cluster`'s supervisor handles) is passed
/// around by cloning a handle rather than threading a reference.
#[derive(Clone, Default)]
pub struct SnapshotCache {
    inner: Arc<RwLock<BTreeMap<String, Entry>>>,
}

/// Bound on the per-watcher delta channel. A slow watcher backs up behind
/// this before the cache's `set` call would block; size chosen generously
/// since one delta is sent per changed resource class, not per resource.
const WATCHER_CHANNEL_CAPACITY: usize = 64;

impl SnapshotCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot for `node_id`, if any.
    ///
    /// Callers use this to decide whether composition is needed at all
    /// (SPEC_FULL §10's `CheckSnapshot` short-circuit): an existing entry
    /// means the discovery callback can skip invoking the composer.
    pub async fn get(&self, node_id: &str) -> Option<Snapshot> {
        self.inner.read().await.get(node_id).map(|e| e.snapshot.clone())
    }

    /// Atomically replaces the snapshot for `node_id`. For every resource
    /// class whose version differs from the previous snapshot (or that is
    /// new), enqueues a delta to every registered watcher, in the fixed
    /// class order from [`ResourceClass::ORDER`].
    ///
    /// A watcher whose channel is closed or full is dropped silently; per
    /// spec.md §7's propagation policy, this path is best-effort and must
    /// not block the caller indefinitely.
    pub async fn set(&self, snapshot: Snapshot) {
        let node_id = snapshot.node_id.clone();
        let mut guard = self.inner.write().await;
        let entry = guard.entry(node_id.clone()).or_default();

        let previous = std::mem::replace(&mut entry.snapshot, snapshot.clone());
        entry.watchers.retain(|tx| !tx.is_closed());

        if entry.watchers.is_empty() {
            trace!(node_id = %node_id, "snapshot set with no watchers registered");
            return;
        }

        for class in ResourceClass::ORDER {
            let Some(new_class) = snapshot.classes.get(&class) else { continue };
            let changed = previous.classes.get(&class).map(|c| &c.version) != Some(&new_class.version);
            if !changed {
                continue;
            }
            let delta = ResourceDelta {
                node_id: node_id.clone(),
                class,
                version: new_class.version.clone(),
                resources: new_class.resources.clone(),
            };
            for tx in &entry.watchers {
                if let Err(err) = tx.try_send(delta.clone()) {
                    debug!(node_id = %node_id, ?class, error = %err, "dropping delta for slow or closed watcher");
                }
            }
        }
    }

    /// Registers a new watcher for `node_id` and returns its receiver.
    /// Watchers only ever see deltas produced by `set` calls made after
    /// registration; callers wanting the current state should `get` first.
    pub async fn watch(&self, node_id: &str) -> mpsc::Receiver<ResourceDelta> {
        let (tx, rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let mut guard = self.inner.write().await;
        guard.entry(node_id.to_string()).or_default().watchers.push(tx);
        rx
    }

    /// Removes every entry for `node_id`, including its watchers. Used
    /// when a node's last downstream disconnects and its snapshot should
    /// no longer be retained.
    pub async fn remove(&self, node_id: &str) {
        self.inner.write().await.remove(node_id);
    }

    /// Lists every node-id currently present in the cache. Read-only
    /// introspection for the poke bridge's `GetSnapshotKeys` RPC (spec.md
    /// §4.L).
    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn resource(name: &str) -> TypedResource {
        TypedResource { name: name.into(), gtype: "type.googleapis.com/envoy.config.cluster.v3.Cluster".into(), body: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn get_returns_none_before_any_set() {
        let cache = SnapshotCache::new();
        assert!(cache.get("L1::P1").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = SnapshotCache::new();
        let snap = Snapshot::new("L1::P1", "v1").with_class(ResourceClass::Cluster, "v1", vec![resource("c1")]);
        cache.set(snap.clone()).await;
        assert_eq!(cache.get("L1::P1").await, Some(snap));
    }

    #[tokio::test]
    async fn watcher_receives_delta_only_for_changed_classes() {
        let cache = SnapshotCache::new();
        let mut rx = cache.watch("L1::P1").await;

        let snap_v1 = Snapshot::new("L1::P1", "v1")
            .with_class(ResourceClass::Cluster, "v1", vec![resource("c1")])
            .with_class(ResourceClass::Listener, "v1", vec![resource("l1")]);
        cache.set(snap_v1).await;

        let first = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.class, ResourceClass::Cluster);
        let second = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.class, ResourceClass::Listener);

        // Re-publishing the same versions changes nothing: no further deltas.
        let snap_v1_again = Snapshot::new("L1::P1", "v1")
            .with_class(ResourceClass::Cluster, "v1", vec![resource("c1")])
            .with_class(ResourceClass::Listener, "v1", vec![resource("l1")]);
        cache.set(snap_v1_again).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        // Bumping only the cluster class sends exactly one delta.
        let snap_v2 = Snapshot::new("L1::P1", "v2")
            .with_class(ResourceClass::Cluster, "v2", vec![resource("c1"), resource("c2")])
            .with_class(ResourceClass::Listener, "v1", vec![resource("l1")]);
        cache.set(snap_v2).await;
        let third = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        assert_eq!(third.class, ResourceClass::Cluster);
        assert_eq!(third.version, "v2");
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn remove_clears_snapshot_and_watchers() {
        let cache = SnapshotCache::new();
        let snap = Snapshot::new("L1::P1", "v1").with_class(ResourceClass::Cluster, "v1", vec![resource("c1")]);
        cache.set(snap).await;
        let mut rx = cache.watch("L1::P1").await;
        cache.remove("L1::P1").await;
        assert!(cache.get("L1::P1").await.is_none());

        // A fresh set after removal recreates the entry and its own watcher
        // list; the old receiver is orphaned (sender dropped) rather than
        // fed stale deltas.
        drop(cache);
        assert!(rx.recv().await.is_none());
    }
}
