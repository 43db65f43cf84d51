use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::connectors::{Connector, ConnectorRegistry};
use crate::errors::AppError;
use crate::importer::upsert_batch;
use crate::models::{
    FetchOutcome, IntegrationConfig, ReconcileOutcome, SyncFinish, SyncResult, SyncStatus,
    UpsertOutcome,
};
use crate::normalizer::extract_tax_id;
use crate::reconciler::{reconcile, ReconcileGuard, ReconcilePolicy};
use crate::store::SyncStore;

/// Everything one successful pass produced.
struct PassReport {
    upstream_records: usize,
    qualifying_titles: usize,
    truncated: bool,
    debtors: usize,
    skipped_lookups: usize,
    upsert: UpsertOutcome,
    reconcile: ReconcileOutcome,
    empty_streak: i32,
}

/// Runs fetch → upsert → reconcile for one integration and keeps its sync
/// bookkeeping current.
pub struct SyncService {
    store: Arc<dyn SyncStore>,
    registry: ConnectorRegistry,
    policy: ReconcilePolicy,
    stale_after: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        registry: ConnectorRegistry,
        policy: ReconcilePolicy,
        stale_after: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            stale_after,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String) {
        match self.registry.get(config.integration_type) {
            Ok(connector) => connector.test_connection(config).await,
            Err(e) => (false, e.to_string()),
        }
    }

    /// Fails with `BadRequest` for inactive integrations and `Conflict` when a
    /// run is already in progress. Failures inside the pass are reported as a
    /// result with status `error`.
    pub async fn run_sync(&self, config: &IntegrationConfig) -> Result<SyncResult, AppError> {
        if !config.is_active {
            return Err(AppError::BadRequest(format!(
                "Integration {} is inactive",
                config.id
            )));
        }
        let connector = self.registry.get(config.integration_type)?;

        let started_at = self.clock.now();
        if !self
            .store
            .try_begin_sync(config.id, started_at, started_at - self.stale_after)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "A sync is already running for integration {}",
                config.id
            )));
        }

        tracing::info!(
            "Starting {} sync for provider {} (integration {})",
            config.integration_type.label(),
            config.provider_id,
            config.id
        );

        let pass = self.execute(connector.as_ref(), config, started_at).await;
        let finished_at = self.clock.now();

        let result = match &pass {
            Ok(report) => summarize(report, finished_at),
            Err(e) => {
                tracing::error!(
                    "{} sync failed for provider {}: {}",
                    config.integration_type.label(),
                    config.provider_id,
                    e
                );
                SyncResult {
                    status: SyncStatus::Error,
                    message: e.to_string(),
                    clients_synced: 0,
                    clients_created: 0,
                    clients_updated: 0,
                    clients_failed: 0,
                    clients_removed: 0,
                    synced_at: finished_at,
                }
            }
        };

        let empty_streak = pass
            .as_ref()
            .map(|report| report.empty_streak)
            .unwrap_or(config.consecutive_empty_syncs);
        let finish = SyncFinish {
            status: result.status,
            message: result.message.clone(),
            finished_at,
            empty_streak,
        };
        self.store.finish_sync(config.id, &finish).await?;

        tracing::info!(
            "{} sync for provider {} finished with status {}: {}",
            config.integration_type.label(),
            config.provider_id,
            result.status,
            result.message
        );
        Ok(result)
    }

    async fn execute(
        &self,
        connector: &dyn Connector,
        config: &IntegrationConfig,
        now: DateTime<Utc>,
    ) -> Result<PassReport, AppError> {
        let source = config.integration_type;
        let fetched: FetchOutcome = connector
            .fetch_overdue_debtors(config, self.clock.today())
            .await?;

        let upsert = upsert_batch(
            self.store.as_ref(),
            &fetched.debtors,
            config.provider_id,
            source,
            now,
        )
        .await;

        let current_tax_ids: HashSet<String> = fetched
            .debtors
            .iter()
            .filter_map(|d| extract_tax_id(d, source))
            .collect();

        // Only a listing with no records at all counts towards the empty streak
        let empty_streak = if fetched.upstream_records == 0 {
            config.consecutive_empty_syncs.max(0).saturating_add(1)
        } else {
            0
        };
        let guard = ReconcileGuard {
            upstream_records: fetched.upstream_records,
            qualifying_titles: fetched.qualifying_titles,
            skipped_lookups: fetched.skipped_lookups,
            truncated: fetched.truncated,
            empty_streak: u32::try_from(empty_streak).unwrap_or(u32::MAX),
        };

        let reconcile = reconcile(
            self.store.as_ref(),
            config.provider_id,
            source,
            &current_tax_ids,
            &guard,
            &self.policy,
            now,
        )
        .await?;

        Ok(PassReport {
            upstream_records: fetched.upstream_records,
            qualifying_titles: fetched.qualifying_titles,
            truncated: fetched.truncated,
            debtors: fetched.debtors.len(),
            skipped_lookups: fetched.skipped_lookups,
            upsert,
            reconcile,
            empty_streak,
        })
    }
}

fn summarize(report: &PassReport, synced_at: DateTime<Utc>) -> SyncResult {
    let upsert = report.upsert;
    let all_lookups_failed = report.qualifying_titles > 0 && report.debtors == 0;

    let status = if all_lookups_failed {
        SyncStatus::Error
    } else if upsert.failed > 0
        || report.skipped_lookups > 0
        || report.truncated
        || (report.reconcile.skipped.is_some() && report.upstream_records > 0)
    {
        SyncStatus::Partial
    } else {
        SyncStatus::Success
    };

    let mut message = if report.upstream_records == 0 {
        "No overdue titles found".to_string()
    } else if report.qualifying_titles == 0 {
        format!(
            "{} title(s) returned but none qualified as overdue",
            report.upstream_records
        )
    } else if all_lookups_failed {
        format!(
            "{} overdue title(s) found but all {} customer lookup(s) failed",
            report.qualifying_titles, report.skipped_lookups
        )
    } else {
        format!(
            "{} created, {} updated, {} failed, {} removed",
            upsert.created, upsert.updated, upsert.failed, report.reconcile.removed
        )
    };
    if report.skipped_lookups > 0 && !all_lookups_failed {
        message.push_str(&format!("; {} customer lookup(s) skipped", report.skipped_lookups));
    }
    if let Some(reason) = &report.reconcile.skipped {
        message.push_str(&format!("; reconciliation skipped: {}", reason));
    } else if report.qualifying_titles == 0 && report.reconcile.removed > 0 {
        message.push_str(&format!("; {} removed", report.reconcile.removed));
    }

    SyncResult {
        status,
        message,
        clients_synced: upsert.created + upsert.updated,
        clients_created: upsert.created,
        clients_updated: upsert.updated,
        clients_failed: upsert.failed,
        clients_removed: report.reconcile.removed,
        synced_at,
    }
}
