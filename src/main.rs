use axum::{
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_isp_sync::clock::SystemClock;
use rust_isp_sync::config::Config;
use rust_isp_sync::connectors::{build_http_client, ConnectorRegistry};
use rust_isp_sync::db::Database;
use rust_isp_sync::db_storage::PgStore;
use rust_isp_sync::handlers::{self, AppState};
use rust_isp_sync::policy::SystemPolicy;
use rust_isp_sync::rate_limit::ProviderRateLimiter;
use rust_isp_sync::reconciler::ReconcilePolicy;
use rust_isp_sync::scheduler::Scheduler;
use rust_isp_sync::store::SyncStore;
use rust_isp_sync::sync_service::SyncService;

/// Main entry point for the application.
///
/// Sets up tracing, configuration, the database pool, the ERP connectors, the
/// sync service and its scheduler, then serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_isp_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let store: Arc<dyn SyncStore> = Arc::new(PgStore::new(db.pool.clone()));

    // One HTTP client for every ERP call
    let http = build_http_client(
        Duration::from_secs(config.erp_http_timeout_secs),
        config.erp_accept_invalid_certs,
    )?;
    let registry = ConnectorRegistry::with_defaults(http);
    tracing::info!("ERP connectors registered: ixc, mk-auth, sgp, radiusnet");

    let sync = Arc::new(SyncService::new(
        store.clone(),
        registry,
        ReconcilePolicy {
            empty_confirmations: config.reconcile_empty_confirmations,
        },
        chrono::Duration::minutes(config.sync_stale_after_minutes),
        Arc::new(SystemClock),
    ));

    if config.scheduler_enabled {
        let scheduler = Scheduler::new(
            sync.clone(),
            Duration::from_secs(config.scheduler_tick_secs),
            config.scheduler_window_minutes,
        );
        tokio::spawn(scheduler.run());
    } else {
        tracing::warn!("Auto-sync scheduler disabled by configuration");
    }

    // Build application state
    let app_state = Arc::new(AppState {
        store,
        sync,
        policy: SystemPolicy::from_config(&config),
        manual_limiter: ProviderRateLimiter::new(Duration::from_secs(
            config.manual_sync_cooldown_secs,
        )),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route(
            "/api/v1/integration-types",
            get(handlers::list_integration_types),
        )
        .route(
            "/api/v1/providers/:provider_id/integrations",
            get(handlers::list_integrations).post(handlers::create_integration),
        )
        .route(
            "/api/v1/providers/:provider_id/integrations/:id",
            axum::routing::delete(handlers::delete_integration),
        )
        .route(
            "/api/v1/providers/:provider_id/integrations/:id/auto-sync",
            patch(handlers::update_auto_sync),
        )
        .route(
            "/api/v1/providers/:provider_id/integrations/:id/test",
            post(handlers::test_integration),
        )
        .route(
            "/api/v1/providers/:provider_id/integrations/:id/sync",
            post(handlers::sync_integration),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB is plenty for integration payloads
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
