use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{CanonicalCandidate, ClientRecord, ExternalDebtor, SourceType, UpsertOutcome};
use crate::normalizer::normalize;
use crate::store::ClientStore;

/// Normalizes each record and creates or refreshes the provider's client row.
/// One bad record never aborts the batch.
pub async fn upsert_batch<S: ClientStore + ?Sized>(
    store: &S,
    records: &[ExternalDebtor],
    provider_id: Uuid,
    source: SourceType,
    now: DateTime<Utc>,
) -> UpsertOutcome {
    let mut outcome = UpsertOutcome::default();

    for record in records {
        let Some(candidate) = normalize(record, source) else {
            tracing::debug!(
                "{} customer {} is not importable (missing name, cpf or debt)",
                source.label(),
                record.external_id
            );
            outcome.failed += 1;
            continue;
        };

        match upsert_one(store, &candidate, provider_id, source, now).await {
            Ok(true) => outcome.created += 1,
            Ok(false) => outcome.updated += 1,
            Err(e) => {
                tracing::error!(
                    "Failed to store {} customer {}: {}",
                    source.label(),
                    record.external_id,
                    e
                );
                outcome.failed += 1;
            }
        }
    }

    tracing::info!(
        "Upsert for provider {}: {} created, {} updated, {} failed",
        provider_id,
        outcome.created,
        outcome.updated,
        outcome.failed
    );
    outcome
}

/// Returns true when a new row was inserted.
async fn upsert_one<S: ClientStore + ?Sized>(
    store: &S,
    candidate: &CanonicalCandidate,
    provider_id: Uuid,
    source: SourceType,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    if let Some(existing) = store.find_active_by_cpf(provider_id, &candidate.cpf).await? {
        store
            .update_imported_fields(existing.id, candidate, now)
            .await?;
        return Ok(false);
    }

    let client = ClientRecord {
        id: Uuid::new_v4(),
        provider_id,
        name: candidate.name.clone(),
        cpf: candidate.cpf.clone(),
        email: candidate.email.clone(),
        phone: candidate.phone.clone(),
        address: candidate.address.clone(),
        bairro: candidate.bairro.clone(),
        debt_amount: candidate.debt_amount.clone(),
        reason: candidate.reason.clone(),
        inclusion_date: now.date_naive(),
        observations: Some(format!(
            "{} em {}",
            source.origin_marker(),
            now.format("%d/%m/%Y %H:%M")
        )),
        risk_level: candidate.risk_level,
        is_active: true,
        boletos: Json(candidate.boletos.clone()),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    store.insert_client(&client).await?;
    Ok(true)
}
