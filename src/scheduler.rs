use chrono::{DateTime, NaiveDateTime, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::errors::AppError;
use crate::models::IntegrationConfig;
use crate::sync_service::SyncService;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// True when `now` is within `window_minutes` of `sync_time`, either side,
/// wrapping around midnight.
pub fn within_window(sync_time: NaiveTime, now: NaiveTime, window_minutes: i64) -> bool {
    let diff = (i64::from(now.num_seconds_from_midnight())
        - i64::from(sync_time.num_seconds_from_midnight()))
    .rem_euclid(SECONDS_PER_DAY);
    let distance = diff.min(SECONDS_PER_DAY - diff);
    distance <= window_minutes * 60
}

/// Whether the scheduler should start this integration now.
pub fn is_due(
    integration: &IntegrationConfig,
    local_now: NaiveDateTime,
    now: DateTime<Utc>,
    window_minutes: i64,
) -> bool {
    if !integration.is_active || !integration.auto_sync_enabled {
        return false;
    }
    if !within_window(integration.auto_sync_time, local_now.time(), window_minutes) {
        return false;
    }

    // A run inside this window already happened
    let recent = chrono::Duration::minutes(2 * window_minutes + 1);
    match integration.last_sync {
        Some(last) => now - last > recent,
        None => true,
    }
}

/// Periodically starts the auto-syncs that are due.
pub struct Scheduler {
    service: Arc<SyncService>,
    tick: Duration,
    window_minutes: i64,
}

impl Scheduler {
    pub fn new(service: Arc<SyncService>, tick: Duration, window_minutes: i64) -> Self {
        Self {
            service,
            tick,
            window_minutes,
        }
    }

    pub async fn run(self) {
        tracing::info!(
            "Auto-sync scheduler started (tick {}s, window {}min)",
            self.tick.as_secs(),
            self.window_minutes
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = self.tick_once().await {
                tracing::error!("Scheduler tick failed: {}", e);
            }
        }
    }

    /// Spawns one task per due integration and returns their handles.
    pub async fn tick_once(&self) -> Result<Vec<JoinHandle<()>>, AppError> {
        let clock = self.service.clock();
        let local_now = clock.local_now();
        let now = clock.now();

        let candidates = self.service.store().list_auto_sync_enabled().await?;
        let due: Vec<IntegrationConfig> = candidates
            .into_iter()
            .filter(|i| is_due(i, local_now, now, self.window_minutes))
            .collect();

        if !due.is_empty() {
            tracing::info!("{} integration(s) due for auto-sync", due.len());
        }

        Ok(due
            .into_iter()
            .map(|integration| {
                let service = Arc::clone(&self.service);
                tokio::spawn(async move {
                    match service.run_sync(&integration).await {
                        Ok(result) => tracing::info!(
                            "Auto-sync {} for provider {}: {}",
                            integration.integration_type.label(),
                            integration.provider_id,
                            result.status
                        ),
                        Err(e) if already_running(&e) => {
                            tracing::debug!("Auto-sync skipped: {}", e)
                        }
                        Err(e) => tracing::error!(
                            "Auto-sync {} for provider {} failed: {}",
                            integration.integration_type.label(),
                            integration.provider_id,
                            e
                        ),
                    }
                })
            })
            .collect())
    }
}

/// A held sync guard, possibly under context wrappers.
fn already_running(err: &AppError) -> bool {
    matches!(err.root(), AppError::Conflict(_))
}
