use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use armada_common::shutdown::shutdown_signal;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::agent_rpc::AgentServiceImpl;
use crate::args::{ServerArgs, StoreBackend};
use crate::cache::Cache;
use crate::handlers;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::proto::agent::agent_service_server::AgentServiceServer;
use crate::registry::ClusterRegistry;
use crate::session::SessionManager;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;
use crate::store::{ClusterStore, OperationStore};

/// Shared state behind both the HTTP API and the agent gRPC service.
#[derive(Clone)]
pub struct AppState {
    pub registry: ClusterRegistry,
    pub operations: Arc<dyn OperationStore>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Orchestrator,
    pub cache: Option<Cache>,
    pub channel_capacity: usize,
    pub default_timeout_seconds: i64,
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(handlers::health))
        .route("/clusters", get(handlers::list_clusters))
        .route(
            "/clusters/{id}",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route(
            "/clusters/{id}/operations",
            get(handlers::list_cluster_operations),
        )
        .route("/clusters/{id}/manifests", post(handlers::apply_manifests))
        .route("/clusters/{id}/resources", get(handlers::list_resources))
        .route("/operations/{id}", get(handlers::get_operation))
        .route("/operations/{id}/cancel", post(handlers::cancel_operation))
        .layer(axum::middleware::from_fn(armada_common::access_log::public))
        .with_state(state)
}

/// Run the hub: HTTP API, agent gRPC service, worker pool and monitor.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let (clusters, operations): (Arc<dyn ClusterStore>, Arc<dyn OperationStore>) = match args.store
    {
        StoreBackend::Postgres => {
            let pool = armada_common::postgres::create_pool(args.postgres.clone()).await;
            let store = PgStore::new(pool);
            store.init_schema().await?;
            (Arc::new(store.clone()), Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; state will not survive a restart");
            let store = MemoryStore::new();
            (Arc::new(store.clone()), Arc::new(store))
        }
    };

    let cache = if args.no_cache {
        None
    } else {
        let pool = armada_common::redis::init_redis(&args.redis).await;
        Some(Cache::new(pool))
    };

    let registry = ClusterRegistry::new(clusters, cache.clone());
    let sessions = Arc::new(SessionManager::new(args.heartbeat_interval));
    let orchestrator = Orchestrator::new(
        registry.clone(),
        operations.clone(),
        sessions.clone(),
        OrchestratorConfig {
            workers: args.workers,
            channel_capacity: args.channel_capacity,
            queue_depth: args.queue_depth,
            heartbeat_interval: args.heartbeat_interval,
        },
    );
    orchestrator.start().await?;

    let state = AppState {
        registry,
        operations,
        sessions,
        orchestrator: orchestrator.clone(),
        cache,
        channel_capacity: args.channel_capacity,
        default_timeout_seconds: args.default_timeout_seconds,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    tracing::info!(%http_addr, "starting HTTP API server");
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_cancel = cancel.clone();
    let http_server = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            http_cancel.cancelled().await;
        });

    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", args.grpc_port).parse()?;
    tracing::info!(%grpc_addr, "starting agent gRPC server");
    let grpc_cancel = cancel.clone();
    let grpc_server = Server::builder()
        .add_service(AgentServiceServer::new(AgentServiceImpl::new(state)))
        .serve_with_shutdown(grpc_addr, async move {
            grpc_cancel.cancelled().await;
        });

    armada_common::signal_ready();

    tokio::select! {
        result = http_server => {
            if let Err(e) = &result {
                tracing::error!(?e, "HTTP server exited with error");
            }
            result?;
        }
        result = grpc_server => {
            if let Err(e) = &result {
                tracing::error!(?e, "agent gRPC server exited with error");
            }
            result?;
        }
    }

    orchestrator.shutdown().await;
    tracing::info!("server stopped gracefully");
    Ok(())
}
