//! Dispatch handler (spec.md §4.J): per-command-type processor/responser
//! pairs, target resolution, and local-vs-forward routing.
//!
//! Grounded on `controller/client/handlers/commands.go`'s
//! `HandleSendCommand` for the top-level algorithm (resolve targets ->
//! per-target processor -> send -> responser, abort on first target-level
//! error) and on the `processor/*.go` / `responser/*.go` pairs
//! (`deploy.go`, `undeploy.go`, `client_stats.go`, `network.go`,
//! `systemd.go`, `frr.go`, `general_log.go`, `proxy.go`) for what each
//! command type's payload and side effects are. The static registration
//! table those files build with `RegisterProcessor`/`RegisterResponser`
//! calls becomes a `once_cell::sync::Lazy` table of command-kind
//! descriptors here (SPEC_FULL §10), since dispatch itself is a plain
//! `match` over [`CommandOperation`] rather than a dynamic registry —
//! idiomatic Rust prefers the exhaustiveness check over a runtime lookup
//! when the variant set is closed.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetd_agent_protocol::{CommandKind, DispatchError};
use fleetd_command_router::CommandRouter;
use fleetd_forwarder::Forwarder;
use fleetd_proto::agent::{command, command_response, Command, CommandResponse, Identity, RequestDeploy, RequestEnvoyAdmin, RequestFrr, RequestGeneralLog, RequestNetwork, RequestService, RequestUnDeploy};
use fleetd_registry_client::RegistryClient;
use fleetd_store::{Store, StoreError};
use fleetd_types::ServiceBinding;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Every command kind this dispatch handler knows how to build a payload
/// and responser view for, declared once at startup (SPEC_FULL §10).
pub static COMMAND_KINDS: Lazy<Vec<CommandKind>> = Lazy::new(|| {
    vec![
        CommandKind::new("deploy", ""),
        CommandKind::new("undeploy", ""),
        CommandKind::new("client_stats", ""),
        CommandKind::new("network", ""),
        CommandKind::new("service", ""),
        CommandKind::new("frr", ""),
        CommandKind::new("general_log", ""),
        CommandKind::new("envoy_admin", ""),
    ]
});

/// The operation requested for one or more target agents. One variant per
/// entry in [`COMMAND_KINDS`].
#[derive(Debug, Clone)]
pub enum CommandOperation {
    Deploy { version: String, bootstrap: Vec<u8> },
    UnDeploy,
    ClientStats,
    Network { interfaces: Vec<String> },
    Service { count: u32, search: String, components: Vec<String>, levels: Vec<String> },
    Frr { protocol: String, bgp: bool },
    GeneralLog { count: u32 },
    EnvoyAdmin { method: String, path: String, queries: BTreeMap<String, String> },
}

impl CommandOperation {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        let r#type = match self {
            Self::Deploy { .. } => "deploy",
            Self::UnDeploy => "undeploy",
            Self::ClientStats => "client_stats",
            Self::Network { .. } => "network",
            Self::Service { .. } => "service",
            Self::Frr { .. } => "frr",
            Self::GeneralLog { .. } => "general_log",
            Self::EnvoyAdmin { .. } => "envoy_admin",
        };
        CommandKind::new(r#type, "")
    }
}

/// A command request addressed to a managed listener's fleet, or to
/// specific clients explicitly (spec.md §4.J step 1).
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub project: String,
    pub downstream_address: String,
    pub target_client_ids: Option<Vec<String>>,
    pub operation: CommandOperation,
}

#[derive(Debug, Error)]
pub enum DispatchHandlerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no target clients resolved for {name}/{project}")]
    NoTargets { name: String, project: String },

    #[error(transparent)]
    Forward(#[from] fleetd_forwarder::ForwardError),
}

/// A target-level failure carrying whatever views were already produced
/// for earlier targets (spec.md §4.J step 3: "Any target-level error
/// aborts the whole call and returns that error along with accumulated
/// partial results").
#[derive(Debug)]
pub struct PartialFailure {
    pub error: DispatchHandlerError,
    pub partial: Vec<serde_json::Value>,
}

pub type DispatchHandlerResult<T> = Result<T, PartialFailure>;

/// Wires together 4.G (local send), 4.H (ownership lookup), and 4.I
/// (forwarding) behind the single top-level algorithm spec.md §4.J
/// describes.
pub struct DispatchHandler {
    router: CommandRouter,
    forwarder: Forwarder,
    registry: Arc<Mutex<RegistryClient>>,
    local_controller_id: String,
}

impl DispatchHandler {
    #[must_use]
    pub fn new(router: CommandRouter, forwarder: Forwarder, registry: Arc<Mutex<RegistryClient>>, local_controller_id: String) -> Self {
        Self { router, forwarder, registry, local_controller_id }
    }

    /// Runs the top-level dispatch algorithm for `req` against `store`.
    pub async fn dispatch<S: Store>(&self, store: &S, req: CommandRequest) -> DispatchHandlerResult<Vec<serde_json::Value>> {
        let targets = Self::resolve_targets(store, &req).await.map_err(|error| PartialFailure { error, partial: vec![] })?;

        let mut views = Vec::with_capacity(targets.len());
        for target in targets {
            match self.dispatch_one(store, &req, &target).await {
                Ok(view) => views.push(view),
                Err(error) => return Err(PartialFailure { error, partial: views }),
            }
        }
        Ok(views)
    }

    async fn resolve_targets<S: Store>(store: &S, req: &CommandRequest) -> Result<Vec<String>, DispatchHandlerError> {
        if let Some(explicit) = &req.target_client_ids {
            return Ok(explicit.clone());
        }
        let binding = store.get_service_binding(&req.name, &req.project).await?;
        let targets: Vec<String> = binding.map(|b| b.clients.into_iter().map(|c| c.client_id).collect()).unwrap_or_default();
        if targets.is_empty() {
            return Err(DispatchHandlerError::NoTargets { name: req.name.clone(), project: req.project.clone() });
        }
        Ok(targets)
    }

    async fn dispatch_one<S: Store>(&self, store: &S, req: &CommandRequest, target: &str) -> Result<serde_json::Value, DispatchHandlerError> {
        let payload = build_payload(store, req, target).await?;
        let kind = req.operation.kind();

        let response = match self.registry.lock().await.get_client_details(target).await {
            Ok(details) if details.controller_id != self.local_controller_id => {
                let command_id = fleetd_agent_protocol::CommandId::generate().0;
                let command = Command {
                    command_id: command_id.clone(),
                    r#type: kind.r#type.clone(),
                    subtype: kind.subtype.clone(),
                    identity: Some(Identity { client_id: target.to_string(), session_token: String::new() }),
                    payload: Some(payload),
                };
                let reply = self.forwarder.forward(&details.controller_fqdn, command).await?;
                debug_assert_eq!(reply.command_id, command_id);
                reply
            }
            Ok(_) => self.router.send(target, &kind.r#type, &kind.subtype, payload).await?,
            Err(err) => {
                warn!(target, error = %err, "registry lookup failed, attempting local send");
                self.router.send(target, &kind.r#type, &kind.subtype, payload).await?
            }
        };

        apply_responser(store, req, &response).await
    }
}

async fn build_payload<S: Store>(store: &S, req: &CommandRequest, target: &str) -> Result<command::Payload, DispatchHandlerError> {
    match &req.operation {
        CommandOperation::Deploy { version, bootstrap } => {
            let admin_port = ensure_binding(store, req, target).await?;
            Ok(command::Payload::Deploy(RequestDeploy {
                name: req.name.clone(),
                downstream_address: req.downstream_address.clone(),
                port: u32::from(admin_port),
                version: version.clone(),
                bootstrap: bootstrap.clone(),
            }))
        }
        CommandOperation::UnDeploy => {
            let binding = store.get_service_binding(&req.name, &req.project).await?;
            let admin_port = binding.map(|b| b.admin_port).ok_or_else(|| StoreError::NotFound {
                collection: fleetd_types::Collection::Listeners,
                name: req.name.clone(),
                project: req.project.clone(),
            })?;
            Ok(command::Payload::Undeploy(RequestUnDeploy { name: req.name.clone(), port: u32::from(admin_port), downstream_address: req.downstream_address.clone() }))
        }
        CommandOperation::ClientStats => Ok(command::Payload::ClientStats(fleetd_proto::agent::RequestClientStats {})),
        CommandOperation::Network { interfaces } => Ok(command::Payload::Network(RequestNetwork { interfaces: interfaces.clone() })),
        CommandOperation::Service { count, search, components, levels } => {
            let admin_port = admin_port(store, req).await?;
            Ok(command::Payload::Service(RequestService {
                name: req.name.clone(),
                port: u32::from(admin_port),
                count: *count,
                search: search.clone(),
                components: components.clone(),
                levels: levels.clone(),
            }))
        }
        CommandOperation::Frr { protocol, bgp } => Ok(command::Payload::Frr(RequestFrr { protocol: protocol.clone(), bgp: *bgp })),
        CommandOperation::GeneralLog { count } => Ok(command::Payload::GeneralLog(RequestGeneralLog { count: *count })),
        CommandOperation::EnvoyAdmin { method, path, queries } => {
            let admin_port = admin_port(store, req).await?;
            Ok(command::Payload::EnvoyAdmin(RequestEnvoyAdmin { name: req.name.clone(), port: u32::from(admin_port), method: method.clone(), path: path.clone(), queries: queries.clone() }))
        }
    }
}

async fn admin_port<S: Store>(store: &S, req: &CommandRequest) -> Result<u16, StoreError> {
    let binding = store.get_service_binding(&req.name, &req.project).await?;
    binding.map(|b| b.admin_port).ok_or_else(|| StoreError::NotFound { collection: fleetd_types::Collection::Listeners, name: req.name.clone(), project: req.project.clone() })
}

/// Mints an admin port on first deploy, or reuses the binding's existing
/// one.
async fn ensure_binding<S: Store>(store: &S, req: &CommandRequest, target: &str) -> Result<u16, StoreError> {
    match store.get_service_binding(&req.name, &req.project).await? {
        Some(binding) => Ok(binding.admin_port),
        None => {
            let admin_port = store.next_admin_port(&req.name, &req.project).await?;
            let mut binding = ServiceBinding { name: req.name.clone(), project: req.project.clone(), admin_port, clients: vec![] };
            binding.add_client(target.to_string(), req.downstream_address.clone());
            store.upsert_service_binding(binding).await?;
            Ok(admin_port)
        }
    }
}

/// Post-receive side effects (spec.md §4.J Responser contract): on
/// deploy, add the agent to the service binding; on undeploy, remove it
/// and prune the envoy record; `envoy_admin` best-effort parses its
/// opaque body.
async fn apply_responser<S: Store>(store: &S, req: &CommandRequest, response: &CommandResponse) -> Result<serde_json::Value, DispatchHandlerError> {
    if !response.success {
        warn!(error = %response.error, "command response reported failure");
    }

    match (&req.operation, response.success) {
        (CommandOperation::Deploy { .. }, true) => {
            if let Some(mut binding) = store.get_service_binding(&req.name, &req.project).await? {
                binding.add_client(response.identity.as_ref().map(|i| i.client_id.clone()).unwrap_or_default(), req.downstream_address.clone());
                store.upsert_service_binding(binding).await?;
            }
        }
        (CommandOperation::UnDeploy, true) => {
            if let Some(mut binding) = store.get_service_binding(&req.name, &req.project).await? {
                if let Some(identity) = &response.identity {
                    binding.remove_client(&identity.client_id);
                }
                if binding.is_empty() {
                    store.delete_service_binding(&req.name, &req.project).await?;
                    store.delete_envoy_record(&req.name, &req.project).await?;
                } else {
                    store.upsert_service_binding(binding).await?;
                }
            }
        }
        _ => {}
    }

    Ok(response_view(req, response))
}

/// `/logging` and `/envoy` admin paths return YAML bodies; every other
/// admin path returns JSON (mirrors `responser/proxy.go`'s `isYAML`).
fn admin_path_is_yaml(req: &CommandRequest) -> bool {
    matches!(&req.operation, CommandOperation::EnvoyAdmin { path, .. } if path == "/logging" || path == "/envoy")
}

/// Parses `str` as JSON, the way `tryParseJSON` does: only attempted when
/// the string looks like an object or array.
fn try_parse_json(str: &str) -> Option<serde_json::Value> {
    let first = str.as_bytes().first()?;
    if str.len() < 2 || (*first != b'{' && *first != b'[') {
        return None;
    }
    serde_json::from_str(str).ok()
}

/// Parses `str` as YAML, the way `tryParseYAML` does, re-expressed as
/// `serde_json::Value` so the rest of the view stays one type.
fn try_parse_yaml(str: &str) -> Option<serde_json::Value> {
    if str.is_empty() {
        return None;
    }
    let parsed: serde_yaml::Value = serde_yaml::from_str(str).ok()?;
    serde_json::to_value(parsed).ok()
}

/// Recurses into an already-parsed body, re-parsing any nested string leaf
/// with the same JSON-or-YAML picker (mirrors `parseBody`'s recursion into
/// maps and arrays, leaving scalars untouched).
fn parse_nested_body(value: serde_json::Value, is_yaml: bool) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut result = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                let parsed = match v {
                    serde_json::Value::String(s) => {
                        let nested = if is_yaml { try_parse_yaml(&s) } else { try_parse_json(&s) };
                        nested.unwrap_or(serde_json::Value::String(s))
                    }
                    serde_json::Value::Object(_) => parse_nested_body(v, is_yaml),
                    serde_json::Value::Array(items) => {
                        serde_json::Value::Array(items.into_iter().map(|item| parse_nested_body(item, is_yaml)).collect())
                    }
                    other => other,
                };
                result.insert(key, parsed);
            }
            serde_json::Value::Object(result)
        }
        other => other,
    }
}

/// Best-effort textual-body parsing for an `envoy_admin` response, and a
/// plain JSON rendering for every other response kind (spec.md §4.J:
/// "parsing opaque textual bodies from admin-proxy responses (best-effort
/// JSON or YAML, depending on the admin path)").
fn response_view(req: &CommandRequest, response: &CommandResponse) -> serde_json::Value {
    let Some(command_response::Result::EnvoyAdmin(admin)) = &response.result else {
        return serde_json::json!({
            "command_id": response.command_id,
            "success": response.success,
            "error": response.error,
        });
    };

    let is_yaml = admin_path_is_yaml(req);
    let top = if is_yaml { try_parse_yaml(&admin.body) } else { try_parse_json(&admin.body) };
    let body = match top {
        Some(parsed) => parse_nested_body(parsed, is_yaml),
        None => serde_json::Value::String(admin.body.clone()),
    };

    serde_json::json!({
        "command_id": response.command_id,
        "success": response.success,
        "status_code": admin.status_code,
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use fleetd_store::MemoryStore;
    use fleetd_types::ServiceBinding;

    use super::*;

    fn deploy_request(target_client_ids: Option<Vec<String>>) -> CommandRequest {
        CommandRequest {
            name: "L1".into(),
            project: "P1".into(),
            downstream_address: "10.0.0.1:443".into(),
            target_client_ids,
            operation: CommandOperation::Deploy { version: "v1".into(), bootstrap: b"{}".to_vec() },
        }
    }

    #[tokio::test]
    async fn resolve_targets_uses_explicit_list_without_touching_store() {
        let store = MemoryStore::new();
        let req = deploy_request(Some(vec!["c1".into(), "c2".into()]));
        let targets = DispatchHandler::resolve_targets(&store, &req).await.unwrap();
        assert_eq!(targets, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn resolve_targets_falls_back_to_service_binding_clients() {
        let store = MemoryStore::new();
        let mut binding = ServiceBinding { name: "L1".into(), project: "P1".into(), admin_port: 33100, clients: vec![] };
        binding.add_client("c1".into(), "10.0.0.1:443".into());
        store.upsert_service_binding(binding).await.unwrap();

        let req = deploy_request(None);
        let targets = DispatchHandler::resolve_targets(&store, &req).await.unwrap();
        assert_eq!(targets, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn resolve_targets_errors_when_nothing_resolves() {
        let store = MemoryStore::new();
        let req = deploy_request(None);
        let err = DispatchHandler::resolve_targets(&store, &req).await.unwrap_err();
        assert!(matches!(err, DispatchHandlerError::NoTargets { .. }));
    }

    #[tokio::test]
    async fn ensure_binding_mints_port_once_then_reuses_it() {
        let store = MemoryStore::new();
        let req = deploy_request(Some(vec!["c1".into()]));

        let first = ensure_binding(&store, &req, "c1").await.unwrap();
        let second = ensure_binding(&store, &req, "c1").await.unwrap();
        assert_eq!(first, second);

        let binding = store.get_service_binding("L1", "P1").await.unwrap().unwrap();
        assert_eq!(binding.admin_port, first);
        assert_eq!(binding.clients.len(), 1);
    }

    #[tokio::test]
    async fn build_payload_undeploy_fails_without_an_existing_binding() {
        let store = MemoryStore::new();
        let req = CommandRequest { operation: CommandOperation::UnDeploy, ..deploy_request(Some(vec!["c1".into()])) };
        let err = build_payload(&store, &req, "c1").await.unwrap_err();
        assert!(matches!(err, DispatchHandlerError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn apply_responser_deploy_success_adds_client_to_binding() {
        let store = MemoryStore::new();
        let admin_port = ensure_binding(&store, &deploy_request(Some(vec!["c1".into()])), "c1").await.unwrap();
        let req = deploy_request(Some(vec!["c2".into()]));
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: Some(Identity { client_id: "c2".into(), session_token: String::new() }),
            success: true,
            error: String::new(),
            result: None,
        };

        apply_responser(&store, &req, &response).await.unwrap();

        let binding = store.get_service_binding("L1", "P1").await.unwrap().unwrap();
        assert_eq!(binding.admin_port, admin_port);
        assert_eq!(binding.clients.len(), 2);
    }

    #[tokio::test]
    async fn apply_responser_undeploy_success_removes_client_and_deletes_empty_binding() {
        let store = MemoryStore::new();
        ensure_binding(&store, &deploy_request(Some(vec!["c1".into()])), "c1").await.unwrap();

        let req = CommandRequest { operation: CommandOperation::UnDeploy, ..deploy_request(Some(vec!["c1".into()])) };
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: Some(Identity { client_id: "c1".into(), session_token: String::new() }),
            success: true,
            error: String::new(),
            result: None,
        };

        apply_responser(&store, &req, &response).await.unwrap();

        assert!(store.get_service_binding("L1", "P1").await.unwrap().is_none());
        assert!(store.get_envoy_record("L1", "P1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_responser_failure_leaves_binding_untouched() {
        let store = MemoryStore::new();
        ensure_binding(&store, &deploy_request(Some(vec!["c1".into()])), "c1").await.unwrap();

        let req = deploy_request(Some(vec!["c2".into()]));
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: Some(Identity { client_id: "c2".into(), session_token: String::new() }),
            success: false,
            error: "deploy failed".into(),
            result: None,
        };

        apply_responser(&store, &req, &response).await.unwrap();

        let binding = store.get_service_binding("L1", "P1").await.unwrap().unwrap();
        assert_eq!(binding.clients.len(), 1);
    }

    fn envoy_admin_request(path: &str) -> CommandRequest {
        CommandRequest {
            operation: CommandOperation::EnvoyAdmin { method: "GET".into(), path: path.into(), queries: BTreeMap::new() },
            ..deploy_request(Some(vec!["c1".into()]))
        }
    }

    #[test]
    fn response_view_parses_envoy_admin_json_body() {
        let req = envoy_admin_request("/stats");
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: None,
            success: true,
            error: String::new(),
            result: Some(command_response::Result::EnvoyAdmin(fleetd_proto::agent::ResponseEnvoyAdmin {
                status_code: 200,
                body: "{\"clusters\": []}".into(),
            })),
        };

        let view = response_view(&req, &response);
        assert_eq!(view["status_code"], 200);
        assert_eq!(view["body"]["clusters"], serde_json::json!([]));
    }

    #[test]
    fn response_view_falls_back_to_raw_string_on_non_json_body() {
        let req = envoy_admin_request("/stats");
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: None,
            success: true,
            error: String::new(),
            result: Some(command_response::Result::EnvoyAdmin(fleetd_proto::agent::ResponseEnvoyAdmin { status_code: 200, body: "not json".into() })),
        };

        let view = response_view(&req, &response);
        assert_eq!(view["body"], serde_json::Value::String("not json".into()));
    }

    #[test]
    fn response_view_parses_logging_path_body_as_yaml() {
        let req = envoy_admin_request("/logging");
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: None,
            success: true,
            error: String::new(),
            result: Some(command_response::Result::EnvoyAdmin(fleetd_proto::agent::ResponseEnvoyAdmin {
                status_code: 200,
                body: "admin: debug\nrouter: info\n".into(),
            })),
        };

        let view = response_view(&req, &response);
        assert_eq!(view["body"]["admin"], "debug");
        assert_eq!(view["body"]["router"], "info");
    }

    #[test]
    fn response_view_recurses_into_nested_string_bodies() {
        let req = envoy_admin_request("/envoy");
        let response = CommandResponse {
            command_id: "cmd-1".into(),
            identity: None,
            success: true,
            error: String::new(),
            result: Some(command_response::Result::EnvoyAdmin(fleetd_proto::agent::ResponseEnvoyAdmin {
                status_code: 200,
                body: "config_dump: \"version_info: v1\"\n".into(),
            })),
        };

        let view = response_view(&req, &response);
        assert_eq!(view["body"]["config_dump"]["version_info"], "v1");
    }
}
