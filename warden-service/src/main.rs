use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_core::{spawn_aggregator, Engine, TenantRegistry};

use warden_service::admin::{self, AdminState};
use warden_service::grpc::authz::AuthzService;
use warden_service::grpc::ratelimit::RlsService;
use warden_service::proto;
use warden_service::proto::envoy::service::auth::v3::authorization_server::AuthorizationServer;
use warden_service::proto::envoy::service::ratelimit::v3::rate_limit_service_server::RateLimitServiceServer;
use warden_service::{Settings, WardenMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    run(settings).await
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let registry = TenantRegistry::new(settings.registry_config());
    settings.seed_tenants(&registry)?;

    let engine = Arc::new(Engine::new(Arc::clone(&registry), settings.engine_config()));
    let metrics = Arc::new(WardenMetrics::new()?);
    // In-flight decisions across both gRPC surfaces.
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_streams as usize * 2));

    let aggregator = spawn_aggregator(Arc::clone(&registry), Duration::from_secs(1));

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining in-flight requests");
            shutdown_tx.send_replace(true);
        }
    });

    // Admin HTTP + /metrics.
    let admin_addr = settings.admin_addr()?;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin listener {admin_addr}"))?;
    let admin_router = admin::router(AdminState {
        registry: Arc::clone(&registry),
        metrics: Arc::clone(&metrics),
    });
    let mut admin_rx = shutdown_tx.subscribe();
    info!(%admin_addr, "admin http listening");
    let admin_task = tokio::spawn(async move {
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async move {
                let _ = admin_rx.changed().await;
            })
            .await
            .map_err(anyhow::Error::from)
    });

    // ext_authz gRPC.
    let authz_addr = settings.authz_addr()?;
    let authz_service = AuthzService::new(
        Arc::clone(&engine),
        Arc::clone(&metrics),
        Arc::clone(&semaphore),
        settings.tenant_header_key(),
    );
    let (mut authz_health, authz_health_service) = tonic_health::server::health_reporter();
    authz_health
        .set_serving::<AuthorizationServer<AuthzService>>()
        .await;
    let authz_reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    let mut authz_rx = shutdown_tx.subscribe();
    info!(%authz_addr, "ext_authz grpc listening");
    let authz_task = tokio::spawn(
        Server::builder()
            .max_concurrent_streams(settings.max_concurrent_streams)
            .add_service(authz_health_service)
            .add_service(authz_reflection)
            .add_service(
                AuthorizationServer::new(authz_service)
                    .max_decoding_message_size(settings.max_grpc_message_bytes),
            )
            .serve_with_shutdown(authz_addr, async move {
                let _ = authz_rx.changed().await;
            }),
    );

    // rate-limit-service gRPC.
    let ratelimit_addr = settings.ratelimit_addr()?;
    let ratelimit_service = RlsService::new(
        Arc::clone(&engine),
        Arc::clone(&metrics),
        Arc::clone(&semaphore),
        settings.tenant_header_key(),
    );
    let (mut ratelimit_health, ratelimit_health_service) = tonic_health::server::health_reporter();
    ratelimit_health
        .set_serving::<RateLimitServiceServer<RlsService>>()
        .await;
    let ratelimit_reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    let mut ratelimit_rx = shutdown_tx.subscribe();
    info!(%ratelimit_addr, "rate-limit-service grpc listening");
    let ratelimit_task = tokio::spawn(
        Server::builder()
            .max_concurrent_streams(settings.max_concurrent_streams)
            .add_service(ratelimit_health_service)
            .add_service(ratelimit_reflection)
            .add_service(
                RateLimitServiceServer::new(ratelimit_service)
                    .max_decoding_message_size(settings.max_grpc_message_bytes),
            )
            .serve_with_shutdown(ratelimit_addr, async move {
                let _ = ratelimit_rx.changed().await;
            }),
    );

    // Wait for all listeners to drain; bound the drain once shutdown
    // starts.
    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    let mut grace_rx = shutdown_tx.subscribe();
    let drain = async {
        let (authz_result, ratelimit_result, admin_result) =
            tokio::try_join!(authz_task, ratelimit_task, admin_task)?;
        authz_result?;
        ratelimit_result?;
        admin_result?;
        anyhow::Ok(())
    };
    tokio::select! {
        result = drain => result?,
        _ = async {
            let _ = grace_rx.changed().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = settings.shutdown_grace_secs, "drain budget exhausted, closing");
        }
    }

    aggregator.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
