//! Fleet control-plane daemon entry point.
//!
//! Assembles the three layers that make up the core: the discovery server
//! (co-exposing the poke bridge, health, and reflection on the same port),
//! the agent command fabric (`CommandService` + `ControllerService` on a
//! second port), and the registry client's health monitor. Shutdown
//! proceeds in order: stop accepting new streams, cancel per-agent
//! contexts, close the forward-client pool, stop the tracker drain.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleetd_agent_session::AgentSessionTable;
use fleetd_command_router::{CommandRouter, PendingResponses};
use fleetd_command_server::CommandServer;
use fleetd_composer::NoopValidator;
use fleetd_config::FleetdConfig;
use fleetd_discovery::{DiscoveryCallbacks, DiscoveryServer};
use fleetd_dispatch::DispatchHandler;
use fleetd_forwarder::Forwarder;
use fleetd_poke::{PokeHandler, PokeServer};
use fleetd_proto::agent::command_service_server::CommandServiceServer;
use fleetd_proto::controller::controller_service_server::ControllerServiceServer;
use fleetd_proto::discovery::discovery_service_server::DiscoveryServiceServer;
use fleetd_proto::poke::poke_service_server::PokeServiceServer;
use fleetd_registry_client::{RegistryClient, RegistryConfig};
use fleetd_snapshot::SnapshotCache;
use fleetd_store::MemoryStore;
use fleetd_tracker::ConnectionTracker;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod agent_server;
mod error;
mod metrics;

use agent_server::AgentServer;
use error::ControllerError;

/// Fleet control plane: xDS discovery engine, agent command fabric, and
/// cross-controller forwarder.
#[derive(Parser, Debug)]
#[command(name = "fleetd-controller", version, about, long_about = None)]
struct Cli {
    /// Project directory `fleetd.toml`/`fleetd.local.toml` are resolved
    /// against. Defaults to the current directory.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Override the discovery gRPC bind address (default `0.0.0.0:18000`).
    #[arg(long)]
    discovery_bind: Option<String>,

    /// Override the agent gRPC bind address (default `0.0.0.0:50051`).
    #[arg(long)]
    agent_bind: Option<String>,

    /// Override the registry address this replica publishes itself to.
    #[arg(long)]
    registry_address: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    match runtime.block_on(run()) {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "fatal startup or runtime error");
            Err(err)
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.project_dir {
        Some(dir) => FleetdConfig::load_from_dir(dir).context("failed to load configuration")?,
        None => FleetdConfig::load().context("failed to load configuration")?,
    };
    if let Some(bind) = cli.discovery_bind {
        config.discovery.bind_address = bind;
    }
    if let Some(bind) = cli.agent_bind {
        config.agent.bind_address = bind;
    }
    if let Some(address) = cli.registry_address {
        config.registry.address = address;
    }

    info!(project = %config.project.name, "fleetd-controller starting");

    let store = Arc::new(MemoryStore::new());
    let validator = Arc::new(NoopValidator);
    let snapshot = SnapshotCache::new();
    let tracker = ConnectionTracker::spawn(store.clone());
    let sessions = AgentSessionTable::new(config.agent.allowed_registration_tokens.clone());
    let pending = PendingResponses::new();
    let forwarder = Forwarder::new();
    let metrics = Arc::new(metrics::Metrics::new());

    let hostname = hostname_or_default();
    let registry_config =
        RegistryConfig { registry_address: config.registry.address.clone(), controller_id: config.registry.controller_id.clone(), grpc_address: config.registry.grpc_address.clone() };
    let mut registry = RegistryClient::connect(registry_config, &hostname).await.map_err(ControllerError::Registry)?;
    registry.register_controller().await.map_err(ControllerError::Registry)?;
    let local_controller_id = registry.controller_id().to_string();

    let shutdown = CancellationToken::new();

    // Wired for the (out-of-scope) admin surface to consume; nothing in
    // this core binary calls it directly, but it is the shape every
    // command-issuing caller is expected to dispatch through.
    let router = CommandRouter::new(sessions.clone(), pending.clone());
    let _dispatch = Arc::new(DispatchHandler::new(router.clone(), forwarder.clone(), Arc::new(Mutex::new(registry)), local_controller_id));

    let health_monitor_sessions = sessions.clone();
    let health_monitor_registry_config = RegistryConfig {
        registry_address: config.registry.address.clone(),
        controller_id: config.registry.controller_id.clone(),
        grpc_address: config.registry.grpc_address.clone(),
    };
    let health_monitor_hostname = hostname.clone();
    let health_monitor_shutdown = shutdown.clone();
    let health_monitor_handle = tokio::spawn(async move {
        let mut client = match RegistryClient::connect(health_monitor_registry_config, &health_monitor_hostname).await {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "health monitor could not connect to registry, monitor disabled");
                return;
            }
        };
        client.run_health_monitor(move || connected_ids_blocking(&health_monitor_sessions), health_monitor_shutdown).await;
    });

    let poke_handler = Arc::new(PokeHandler::new(store.clone(), validator.clone(), snapshot.clone()));
    let discovery_callbacks = Arc::new(DiscoveryCallbacks::new(snapshot.clone(), store.clone(), validator.clone(), tracker.clone()));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_serving::<DiscoveryServiceServer<DiscoveryServer<MemoryStore, NoopValidator>>>().await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(fleetd_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build gRPC reflection service")?;

    let max_message_bytes = config.discovery.max_message_size_bytes as usize;
    let discovery_service = DiscoveryServiceServer::new(DiscoveryServer::new(discovery_callbacks))
        .max_decoding_message_size(max_message_bytes)
        .max_encoding_message_size(max_message_bytes);

    let discovery_addr = config.discovery.bind_address.parse().context("invalid discovery bind address")?;
    let discovery_router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(config.discovery.keepalive_interval_secs)))
        .http2_keepalive_timeout(Some(Duration::from_secs(config.discovery.keepalive_timeout_secs)))
        .max_concurrent_streams(config.discovery.max_concurrent_streams)
        .add_service(discovery_service)
        .add_service(PokeServiceServer::new(poke_handler))
        .add_service(health_service)
        .add_service(reflection_service);
    let discovery_shutdown = shutdown.clone();
    let mut discovery_handle = tokio::spawn(async move {
        info!(%discovery_addr, "discovery endpoint listening");
        discovery_router
            .serve_with_shutdown(discovery_addr, discovery_shutdown.cancelled())
            .await
            .map_err(|source| ControllerError::DiscoveryBind { address: discovery_addr.to_string(), source })
    });

    let agent_server = AgentServer::new(store.clone(), sessions.clone(), pending.clone());
    let command_server = CommandServer::new(router);
    let agent_addr = config.agent.bind_address.parse().context("invalid agent bind address")?;
    let agent_router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(config.agent.keepalive_interval_secs)))
        .http2_keepalive_timeout(Some(Duration::from_secs(config.agent.keepalive_timeout_secs)))
        .initial_stream_window_size(Some(config.agent.initial_window_size_bytes))
        .add_service(CommandServiceServer::new(agent_server))
        .add_service(ControllerServiceServer::new(command_server));
    let agent_shutdown = shutdown.clone();
    let mut agent_handle = tokio::spawn(async move {
        info!(%agent_addr, "agent endpoint listening");
        agent_router
            .serve_with_shutdown(agent_addr, agent_shutdown.cancelled())
            .await
            .map_err(|source| ControllerError::AgentBind { address: agent_addr.to_string(), source })
    });

    // A server task finishing before the shutdown signal means its bind
    // failed; surface that as a fatal startup error instead of waiting for
    // ctrl-c forever.
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received, stopping accepting new streams");
        }
        joined = &mut discovery_handle => {
            propagate_bind_failure(joined, "discovery")?;
        }
        joined = &mut agent_handle => {
            propagate_bind_failure(joined, "agent")?;
        }
    }
    shutdown.cancel();

    let grace = Duration::from_secs(3);
    let _ = tokio::time::timeout(grace, async {
        let _ = discovery_handle.await;
        let _ = agent_handle.await;
    })
    .await;

    forwarder.close().await;
    health_monitor_handle.abort();
    metrics.connected_agents.set(0);

    info!("fleetd-controller shut down cleanly");
    Ok(())
}

fn propagate_bind_failure(joined: Result<Result<(), ControllerError>, tokio::task::JoinError>, which: &str) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).with_context(|| format!("{which} endpoint exited")),
        Err(err) => Err(err).with_context(|| format!("{which} endpoint task panicked")),
    }
}

fn connected_ids_blocking(sessions: &AgentSessionTable) -> Vec<String> {
    // `run_health_monitor`'s closure is synchronous — the ticker only needs
    // a point-in-time snapshot of who is connected — so the agent table's
    // async accessor is bridged with `block_in_place` to stay a plain
    // `FnMut`.
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(sessions.connected_client_ids()))
}

fn hostname_or_default() -> String {
    hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "fleetd-controller".to_string())
}
