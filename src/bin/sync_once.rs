//! Runs a single sync pass for one integration and prints the result as JSON.
//!
//! Usage: sync_once <provider_id> <integration_id>

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use rust_isp_sync::clock::SystemClock;
use rust_isp_sync::config::Config;
use rust_isp_sync::connectors::{build_http_client, ConnectorRegistry};
use rust_isp_sync::db::Database;
use rust_isp_sync::db_storage::PgStore;
use rust_isp_sync::reconciler::ReconcilePolicy;
use rust_isp_sync::store::{IntegrationStore, SyncStore};
use rust_isp_sync::sync_service::SyncService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_isp_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        anyhow::bail!("usage: {} <provider_id> <integration_id>", args[0]);
    }
    let provider_id: Uuid = args[1]
        .parse()
        .map_err(|_| anyhow::anyhow!("provider_id must be a UUID"))?;
    let integration_id: Uuid = args[2]
        .parse()
        .map_err(|_| anyhow::anyhow!("integration_id must be a UUID"))?;

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;
    let store: Arc<dyn SyncStore> = Arc::new(PgStore::new(db.pool.clone()));

    let integration = store
        .get_integration(provider_id, integration_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("integration {} not found", integration_id))?;

    let http = build_http_client(
        Duration::from_secs(config.erp_http_timeout_secs),
        config.erp_accept_invalid_certs,
    )?;
    let service = SyncService::new(
        store,
        ConnectorRegistry::with_defaults(http),
        ReconcilePolicy {
            empty_confirmations: config.reconcile_empty_confirmations,
        },
        chrono::Duration::minutes(config.sync_stale_after_minutes),
        Arc::new(SystemClock),
    );

    let result = service.run_sync(&integration).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
