//! Dependency walker (spec.md §4.M): on a successful resource write,
//! recursively finds the set of enclosing listeners the mutated resource
//! reaches and pokes each of their bound downstreams.
//!
//! Grounded on the original's `controller/poker/base.go`:
//! `DetectChangedResource`'s visited-set recursion (`Processed.ProcessedResources`
//! as the cycle guard, `Processed.Listeners` to skip a listener already
//! handled in this walk), the managed-vs-unmanaged branch in `HandlePoke`
//! (managed listeners enumerate bound downstream addresses via the service
//! binding and poke each; unmanaged listeners poke once with no address),
//! and `ProcessResource`/`CheckResource`'s downstream-filter lookup, which
//! here is generalized into trying [`Store::find_dependents`] against every
//! known collection rather than a per-`gtype` static filter table (the
//! original's `downstreamfilters` package), since this store boundary has
//! no equivalent per-type registry to consult (DESIGN.md's Open Question
//! decisions).

use std::collections::HashSet;
use std::sync::Arc;

use fleetd_poke::Poker;
use fleetd_store::{ResourceKey, Store, StoreError};
use fleetd_types::Collection;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type WalkResult<T> = Result<T, WalkError>;

/// Every collection that can hold a parent record referencing some other
/// resource, tried in turn since there is no per-`gtype` downstream-filter
/// registry to consult directly (see this crate's module doc).
const PARENT_COLLECTIONS: [Collection; 9] = [
    Collection::Clusters,
    Collection::Listeners,
    Collection::Routes,
    Collection::Endpoints,
    Collection::VirtualHosts,
    Collection::Secrets,
    Collection::Extensions,
    Collection::Filters,
    Collection::Tls,
];

/// One poke the walker issued, for tests and for admin-surface reporting of
/// what a mutation fanned out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokeAttempt {
    pub name: String,
    pub project: String,
    pub downstream_address: Option<String>,
    pub success: bool,
}

/// Recursively finds listeners affected by a resource mutation and pokes
/// them, via `P` — a local [`fleetd_poke::PokeHandler`] or a
/// [`fleetd_poke::PokeClient`] to a peer replica, the walker does not care
/// which.
pub struct DependencyWalker<S, P> {
    store: Arc<S>,
    poker: Arc<P>,
}

impl<S: Store, P: Poker> DependencyWalker<S, P> {
    #[must_use]
    pub fn new(store: Arc<S>, poker: Arc<P>) -> Self {
        Self { store, poker }
    }

    /// Walks from `(collection, name, project)` per spec.md §4.M steps 1-4
    /// and returns every poke attempted. A target-level error (a store
    /// failure while resolving dependents) aborts the walk; an individual
    /// poke failure is logged and does not abort the rest (same as the
    /// original's `HandlePoke`, which logs and continues).
    pub async fn walk(&self, collection: Collection, name: &str, project: &str) -> WalkResult<Vec<PokeAttempt>> {
        let mut visited = HashSet::new();
        let mut pokes = Vec::new();
        self.detect(collection, name, project, &mut visited, &mut pokes).await?;
        Ok(pokes)
    }

    async fn detect(&self, collection: Collection, name: &str, project: &str, visited: &mut HashSet<(Collection, String)>, pokes: &mut Vec<PokeAttempt>) -> WalkResult<()> {
        let visit_key = (collection, name.to_string());
        if visited.contains(&visit_key) {
            return Ok(());
        }
        visited.insert(visit_key);

        if collection == Collection::Listeners {
            return self.handle_listener(name, project, pokes).await;
        }

        for &parent_collection in &PARENT_COLLECTIONS {
            let hits = self.store.find_dependents(parent_collection, name, project).await?;
            for hit in hits {
                Box::pin(self.detect(hit.general.collection, &hit.general.name, project, visited, pokes)).await?;
            }
        }
        Ok(())
    }

    async fn handle_listener(&self, name: &str, project: &str, pokes: &mut Vec<PokeAttempt>) -> WalkResult<()> {
        let record = match self.store.get_resource(&ResourceKey::new(Collection::Listeners, name, project)).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(other) => return Err(other.into()),
        };

        if !record.general.managed {
            self.poke_one(name, project, None, pokes).await;
            return Ok(());
        }

        let binding = self.store.get_service_binding(name, project).await?;
        let Some(binding) = binding.filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        for client in &binding.clients {
            self.poke_one(name, project, Some(client.downstream_address.as_str()), pokes).await;
        }
        Ok(())
    }

    async fn poke_one(&self, name: &str, project: &str, downstream_address: Option<&str>, pokes: &mut Vec<PokeAttempt>) {
        let success = match self.poker.poke(name, project, downstream_address).await {
            Ok(()) => {
                info!(name, project, downstream_address, "poke succeeded");
                true
            }
            Err(err) => {
                warn!(name, project, downstream_address, error = %err, "poke failed");
                false
            }
        };
        pokes.push(PokeAttempt { name: name.to_string(), project: project.to_string(), downstream_address: downstream_address.map(str::to_string), success });
    }
}
