use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{ReconcileOutcome, SourceType};
use crate::normalizer::digits_only;
use crate::store::ClientStore;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    /// Consecutive empty upstream syncs needed before every import is removed.
    pub empty_confirmations: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            empty_confirmations: 2,
        }
    }
}

/// What the current sync pass saw upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileGuard {
    /// Title records the ERP returned, before local filtering.
    pub upstream_records: usize,
    /// Records that parsed and qualified as overdue.
    pub qualifying_titles: usize,
    pub skipped_lookups: usize,
    /// The title listing stopped before the ERP's last record.
    pub truncated: bool,
    /// Consecutive empty upstream results, this pass included.
    pub empty_streak: u32,
}

/// Why reconciliation must not run this pass, if anything.
fn skip_reason(
    current_is_empty: bool,
    guard: &ReconcileGuard,
    policy: &ReconcilePolicy,
) -> Option<String> {
    if guard.truncated {
        return Some(
            "upstream title listing was truncated; imported clients kept".to_string(),
        );
    }
    if guard.skipped_lookups > 0 {
        return Some(format!(
            "{} customer lookup(s) failed; imported clients kept",
            guard.skipped_lookups
        ));
    }
    if !current_is_empty {
        return None;
    }
    if guard.qualifying_titles > 0 {
        return Some(format!(
            "{} overdue title(s) upstream but no debtor resolved; imported clients kept",
            guard.qualifying_titles
        ));
    }
    if guard.upstream_records > 0 {
        return Some(format!(
            "{} upstream title(s) returned but none qualified; imported clients kept",
            guard.upstream_records
        ));
    }
    if guard.empty_streak < policy.empty_confirmations {
        return Some(format!(
            "empty upstream result ({} of {} confirmations); imported clients kept",
            guard.empty_streak, policy.empty_confirmations
        ));
    }
    None
}

/// Soft-deletes the provider's active imports from `source` whose tax id is
/// no longer among the current overdue debtors.
pub async fn reconcile<S: ClientStore + ?Sized>(
    store: &S,
    provider_id: Uuid,
    source: SourceType,
    current_tax_ids: &HashSet<String>,
    guard: &ReconcileGuard,
    policy: &ReconcilePolicy,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, AppError> {
    if let Some(reason) = skip_reason(current_tax_ids.is_empty(), guard, policy) {
        tracing::warn!(
            "Reconciliation skipped for provider {} ({}): {}",
            provider_id,
            source.label(),
            reason
        );
        return Ok(ReconcileOutcome {
            removed: 0,
            skipped: Some(reason),
        });
    }

    if current_tax_ids.is_empty() {
        tracing::warn!(
            "Upstream {} confirmed empty {} times for provider {}; removing all its imported clients",
            source.label(),
            guard.empty_streak,
            provider_id
        );
    }

    let imported = store
        .list_active_imported(provider_id, &source.origin_marker())
        .await?;

    let mut outcome = ReconcileOutcome::default();
    for client in imported {
        let cpf = digits_only(&client.cpf);
        if cpf.is_empty() || current_tax_ids.contains(&cpf) {
            continue;
        }

        match store.deactivate_client(client.id, now).await {
            Ok(true) => {
                tracing::debug!("Client {} no longer overdue in {}; deactivated", client.id, source.label());
                outcome.removed += 1;
            }
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to deactivate client {}: {}", client.id, e),
        }
    }

    tracing::info!(
        "Reconciliation for provider {} ({}): {} removed",
        provider_id,
        source.label(),
        outcome.removed
    );
    Ok(outcome)
}
