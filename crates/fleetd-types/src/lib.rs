//! Core data model shared across the fleet control plane.
//!
//! This crate defines the persisted resource record, the composed-snapshot
//! resource classes, the agent record, and the small set of value types the
//! rest of the workspace passes around. It has no I/O of its own — every
//! type here is `Serialize`/`Deserialize` and free of async or locking
//! concerns, the way `kimberlite-types` hosts the database's core value
//! types without touching storage or networking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a persisted resource record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

/// The physical collection a resource belongs to, derived from its `gtype`.
///
/// Matches the persisted-store collections enumerated in spec.md §6:
/// `clusters`, `listeners`, `routes`, `endpoints`, `virtual_hosts`, `secrets`,
/// `extensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Clusters,
    Listeners,
    Routes,
    Endpoints,
    VirtualHosts,
    Secrets,
    Extensions,
    Filters,
    Tls,
}

/// The resource class a composed snapshot groups resources by.
///
/// spec.md §3: "a map `resource-class -> ordered list of typed resources`".
/// Order here is the fixed watcher-delivery order from spec.md §4.B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Cluster,
    Endpoint,
    Listener,
    Route,
    VirtualHost,
    ExtensionConfig,
    Secret,
}

impl ResourceClass {
    /// Fixed delivery order watchers observe resources in, per spec.md §4.B.
    pub const ORDER: [ResourceClass; 7] = [
        ResourceClass::Cluster,
        ResourceClass::Endpoint,
        ResourceClass::Listener,
        ResourceClass::Route,
        ResourceClass::VirtualHost,
        ResourceClass::ExtensionConfig,
        ResourceClass::Secret,
    ];
}

/// A nested child reference declared in a resource body's `typed_config[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedConfigRef {
    pub gtype: String,
    pub name: String,
    pub collection: Collection,
    pub parent_name: String,
    pub priority: i32,
    pub disabled: bool,
}

/// The `general` sub-document of a persisted resource record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralMeta {
    pub name: String,
    pub version: String,
    pub r#type: String,
    pub gtype: String,
    pub canonical_name: String,
    pub category: String,
    pub collection: Collection,
    pub project: String,
    pub permissions: Vec<String>,
    pub managed: bool,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub typed_config: Vec<TypedConfigRef>,
    #[serde(default)]
    pub config_discovery: Vec<TypedConfigRef>,
}

/// The `resource` sub-document: the opaque proxy-configuration body plus its
/// schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBody {
    /// Major schema version of the proxy binary this body targets.
    pub version: String,
    /// The resource body itself, as the proxy's JSON/protobuf-JSON encoding.
    pub resource: serde_json::Value,
}

/// A persisted resource record (spec.md §3).
///
/// Invariant: `(general.name, general.project, general.version)` is unique
/// within `general.collection`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub general: GeneralMeta,
    pub resource: ResourceBody,
}

impl ResourceRecord {
    /// The `(name, project, version)` triple that must be unique within a
    /// collection.
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.general.name, &self.general.project, &self.general.version)
    }
}

/// A fully-linked, typed resource inside a composed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedResource {
    pub name: String,
    pub gtype: String,
    pub body: serde_json::Value,
}

/// Connectivity status of a node, derived from its downstream list
/// (spec.md §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Offline,
    Partial,
    Live,
}

/// One downstream entry in a node's persisted connectivity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamEntry {
    pub stream_id: i64,
    pub address: String,
    pub envoy_version: String,
    pub client_name: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

/// A bounded, per-node protocol-level error event (spec.md §4.D, N = 50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolErrorEvent {
    pub type_url: String,
    pub message: String,
    pub response_nonce: String,
    pub occurred_at: DateTime<Utc>,
}

/// The persisted connectivity record for a node (the "envoy record" of
/// spec.md's end-to-end scenarios).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvoyRecord {
    pub name: String,
    pub project: String,
    pub downstreams: Vec<DownstreamEntry>,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub errors: Vec<ProtocolErrorEvent>,
}

impl EnvoyRecord {
    /// Recomputes `status` from the current downstream list, per spec.md
    /// §4.E: `Live` iff all connected, `Offline` iff none, else `Partial`.
    pub fn recompute_status(&mut self) {
        let connected = self.downstreams.iter().filter(|d| d.connected).count();
        self.status = if self.downstreams.is_empty() || connected == 0 {
            ConnectionStatus::Offline
        } else if connected == self.downstreams.len() {
            ConnectionStatus::Live
        } else {
            ConnectionStatus::Partial
        };
    }
}

/// An agent record (spec.md §3). Transport handles (`stream-handle`,
/// `cancel-handle`) are process-local and live in `fleetd-agent-session`,
/// not here — this is the persisted/serializable subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub client_id: String,
    pub session_token: String,
    pub name: String,
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
    pub projects: Vec<String>,
    pub access_token: String,
    pub metadata: BTreeMap<String, String>,
}

/// Records which agents have been deployed against a managed listener and
/// the admin port the deployment exposes (spec.md §3 "Service binding").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub name: String,
    pub project: String,
    pub admin_port: u16,
    pub clients: Vec<ServiceBindingClient>,
}

/// One agent entry within a [`ServiceBinding`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBindingClient {
    pub client_id: String,
    pub downstream_address: String,
}

impl ServiceBinding {
    pub fn remove_client(&mut self, client_id: &str) {
        self.clients.retain(|c| c.client_id != client_id);
    }

    pub fn add_client(&mut self, client_id: String, downstream_address: String) {
        if self.clients.iter().any(|c| c.client_id == client_id) {
            return;
        }
        self.clients.push(ServiceBindingClient { client_id, downstream_address });
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downstream(connected: bool) -> DownstreamEntry {
        DownstreamEntry {
            stream_id: 1,
            address: "10.0.0.1:443".into(),
            envoy_version: "1.30".into(),
            client_name: "agent-1".into(),
            connected,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn status_live_when_all_connected() {
        let mut rec = EnvoyRecord {
            name: "L1".into(),
            project: "P1".into(),
            downstreams: vec![downstream(true), downstream(true)],
            status: ConnectionStatus::Offline,
            errors: vec![],
        };
        rec.recompute_status();
        assert_eq!(rec.status, ConnectionStatus::Live);
    }

    #[test]
    fn status_partial_when_mixed() {
        let mut rec = EnvoyRecord {
            name: "L1".into(),
            project: "P1".into(),
            downstreams: vec![downstream(true), downstream(false)],
            status: ConnectionStatus::Offline,
            errors: vec![],
        };
        rec.recompute_status();
        assert_eq!(rec.status, ConnectionStatus::Partial);
    }

    #[test]
    fn status_offline_when_empty_or_none_connected() {
        let mut rec = EnvoyRecord {
            name: "L1".into(),
            project: "P1".into(),
            downstreams: vec![],
            status: ConnectionStatus::Live,
            errors: vec![],
        };
        rec.recompute_status();
        assert_eq!(rec.status, ConnectionStatus::Offline);

        rec.downstreams = vec![downstream(false), downstream(false)];
        rec.recompute_status();
        assert_eq!(rec.status, ConnectionStatus::Offline);
    }

    #[test]
    fn service_binding_add_remove() {
        let mut binding = ServiceBinding {
            name: "L1".into(),
            project: "P1".into(),
            admin_port: 33100,
            clients: vec![],
        };
        binding.add_client("c1".into(), "10.0.0.1:443".into());
        binding.add_client("c1".into(), "10.0.0.1:443".into());
        assert_eq!(binding.clients.len(), 1);

        binding.remove_client("c1");
        assert!(binding.is_empty());
    }

    #[test]
    fn resource_record_roundtrip() {
        let rec = ResourceRecord {
            id: ResourceId("abc".into()),
            general: GeneralMeta {
                name: "L1".into(),
                version: "v1".into(),
                r#type: "listener".into(),
                gtype: "type.googleapis.com/envoy.config.listener.v3.Listener".into(),
                canonical_name: "L1".into(),
                category: "listener".into(),
                collection: Collection::Listeners,
                project: "P1".into(),
                permissions: vec![],
                managed: false,
                metadata: BTreeMap::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                typed_config: vec![],
                config_discovery: vec![],
            },
            resource: ResourceBody { version: "v1".into(), resource: serde_json::json!({}) },
        };
        let json = serde_json::to_string(&rec).expect("serialize");
        let decoded: ResourceRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded.natural_key(), ("L1", "P1", "v1"));
    }
}
