use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{
    CanonicalCandidate, ClientRecord, IntegrationConfig, SourceType, SyncFinish, SyncStatus,
};
use crate::store::{ClientStore, IntegrationStore, SubscriptionStore};

const CLIENT_COLUMNS: &str = "id, provider_id, name, cpf, email, phone, address, bairro, \
     debt_amount, reason, inclusion_date, observations, risk_level, is_active, boletos, \
     created_at, updated_at, deleted_at";

const INTEGRATION_COLUMNS: &str = "id, provider_id, integration_type, display_name, api_url, \
     credentials, is_active, min_days_overdue, auto_sync_enabled, auto_sync_time, last_sync, \
     last_sync_status, last_sync_message, sync_started_at, sync_count, error_count, \
     consecutive_empty_syncs, created_at, updated_at";

/// Postgres-backed storage for clients, integrations and subscriptions.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct IntegrationRow {
    id: Uuid,
    provider_id: Uuid,
    integration_type: String,
    display_name: String,
    api_url: String,
    credentials: Json<HashMap<String, String>>,
    is_active: bool,
    min_days_overdue: i32,
    auto_sync_enabled: bool,
    auto_sync_time: NaiveTime,
    last_sync: Option<DateTime<Utc>>,
    last_sync_status: String,
    last_sync_message: Option<String>,
    sync_started_at: Option<DateTime<Utc>>,
    sync_count: i32,
    error_count: i32,
    consecutive_empty_syncs: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntegrationRow> for IntegrationConfig {
    type Error = AppError;

    fn try_from(row: IntegrationRow) -> Result<Self, Self::Error> {
        Ok(IntegrationConfig {
            id: row.id,
            provider_id: row.provider_id,
            integration_type: row.integration_type.parse::<SourceType>()?,
            display_name: row.display_name,
            api_url: row.api_url,
            credentials: row.credentials.0,
            is_active: row.is_active,
            min_days_overdue: row.min_days_overdue,
            auto_sync_enabled: row.auto_sync_enabled,
            auto_sync_time: row.auto_sync_time,
            last_sync: row.last_sync,
            last_sync_status: SyncStatus::parse(&row.last_sync_status),
            last_sync_message: row.last_sync_message,
            sync_started_at: row.sync_started_at,
            sync_count: row.sync_count,
            error_count: row.error_count,
            consecutive_empty_syncs: row.consecutive_empty_syncs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::InternalError(format!("Failed to serialize column: {}", e)))
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(message.to_string())
        }
        _ => AppError::DatabaseError(err),
    }
}

#[async_trait]
impl ClientStore for PgStore {
    async fn find_active_by_cpf(
        &self,
        provider_id: Uuid,
        cpf_digits: &str,
    ) -> Result<Option<ClientRecord>, AppError> {
        // Stored cpfs may carry punctuation from manual entry
        let sql = format!(
            r#"SELECT {} FROM clients
               WHERE provider_id = $1
                 AND is_active = TRUE
                 AND regexp_replace(cpf, '\D', '', 'g') = $2
               LIMIT 1"#,
            CLIENT_COLUMNS
        );

        sqlx::query_as::<_, ClientRecord>(&sql)
            .bind(provider_id)
            .bind(cpf_digits)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up client by cpf")
    }

    async fn insert_client(&self, client: &ClientRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO clients (
                id, provider_id, name, cpf, email, phone, address, bairro,
                debt_amount, reason, inclusion_date, observations, risk_level,
                is_active, boletos, created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(client.id)
        .bind(client.provider_id)
        .bind(&client.name)
        .bind(&client.cpf)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(&client.address)
        .bind(&client.bairro)
        .bind(&client.debt_amount)
        .bind(&client.reason)
        .bind(client.inclusion_date)
        .bind(&client.observations)
        .bind(client.risk_level)
        .bind(client.is_active)
        .bind(to_json(&client.boletos.0)?)
        .bind(client.created_at)
        .bind(client.updated_at)
        .bind(client.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "an active client with this cpf already exists"))?;

        Ok(())
    }

    async fn update_imported_fields(
        &self,
        id: Uuid,
        candidate: &CanonicalCandidate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE clients SET
                name = $2,
                debt_amount = $3,
                reason = $4,
                risk_level = $5,
                boletos = $6,
                email = COALESCE($7, email),
                phone = COALESCE($8, phone),
                address = COALESCE($9, address),
                bairro = COALESCE($10, bairro),
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&candidate.name)
        .bind(&candidate.debt_amount)
        .bind(&candidate.reason)
        .bind(candidate.risk_level)
        .bind(to_json(&candidate.boletos)?)
        .bind(&candidate.email)
        .bind(&candidate.phone)
        .bind(&candidate.address)
        .bind(&candidate.bairro)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update imported client")?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("client {}", id)));
        }
        Ok(())
    }

    async fn list_active_imported(
        &self,
        provider_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ClientRecord>, AppError> {
        let sql = format!(
            r#"SELECT {} FROM clients
               WHERE provider_id = $1
                 AND is_active = TRUE
                 AND (reason ILIKE $2 OR observations ILIKE $2)"#,
            CLIENT_COLUMNS
        );

        sqlx::query_as::<_, ClientRecord>(&sql)
            .bind(provider_id)
            .bind(format!("%{}%", marker))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list imported clients")
    }

    async fn deactivate_client(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE clients
            SET is_active = FALSE, deleted_at = $2, updated_at = $2
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to soft-delete client")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl IntegrationStore for PgStore {
    async fn get_integration(
        &self,
        provider_id: Uuid,
        id: Uuid,
    ) -> Result<Option<IntegrationConfig>, AppError> {
        let sql = format!(
            "SELECT {} FROM provider_integrations WHERE id = $1 AND provider_id = $2",
            INTEGRATION_COLUMNS
        );

        let row = sqlx::query_as::<_, IntegrationRow>(&sql)
            .bind(id)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load integration")?;

        row.map(IntegrationConfig::try_from).transpose()
    }

    async fn list_integrations(
        &self,
        provider_id: Uuid,
    ) -> Result<Vec<IntegrationConfig>, AppError> {
        let sql = format!(
            "SELECT {} FROM provider_integrations WHERE provider_id = $1 ORDER BY created_at",
            INTEGRATION_COLUMNS
        );

        sqlx::query_as::<_, IntegrationRow>(&sql)
            .bind(provider_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list integrations")?
            .into_iter()
            .map(IntegrationConfig::try_from)
            .collect()
    }

    async fn create_integration(&self, config: &IntegrationConfig) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO provider_integrations (
                id, provider_id, integration_type, display_name, api_url, credentials,
                is_active, min_days_overdue, auto_sync_enabled, auto_sync_time,
                last_sync_status, sync_count, error_count, consecutive_empty_syncs,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 0, 0, $12, $12)
            "#,
        )
        .bind(config.id)
        .bind(config.provider_id)
        .bind(config.integration_type.as_str())
        .bind(&config.display_name)
        .bind(&config.api_url)
        .bind(to_json(&config.credentials)?)
        .bind(config.is_active)
        .bind(config.min_days_overdue)
        .bind(config.auto_sync_enabled)
        .bind(config.auto_sync_time)
        .bind(config.last_sync_status.as_str())
        .bind(config.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(
                e,
                &format!(
                    "{} integration already configured for this provider",
                    config.integration_type
                ),
            )
        })?;

        Ok(())
    }

    async fn delete_integration(&self, provider_id: Uuid, id: Uuid) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM provider_integrations WHERE id = $1 AND provider_id = $2")
                .bind(id)
                .bind(provider_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete integration")?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_auto_sync(
        &self,
        provider_id: Uuid,
        id: Uuid,
        enabled: bool,
        sync_time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE provider_integrations
            SET auto_sync_enabled = $3, auto_sync_time = $4, updated_at = $5
            WHERE id = $1 AND provider_id = $2
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(enabled)
        .bind(sync_time)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update auto-sync settings")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_auto_sync_enabled(&self) -> Result<Vec<IntegrationConfig>, AppError> {
        let sql = format!(
            "SELECT {} FROM provider_integrations \
             WHERE is_active = TRUE AND auto_sync_enabled = TRUE",
            INTEGRATION_COLUMNS
        );

        sqlx::query_as::<_, IntegrationRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list auto-sync integrations")?
            .into_iter()
            .map(IntegrationConfig::try_from)
            .collect()
    }

    async fn try_begin_sync(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // Compare-and-swap: only one caller can flip the row into in_progress
        let result = sqlx::query(
            r#"
            UPDATE provider_integrations
            SET last_sync_status = 'in_progress', sync_started_at = $2, updated_at = $2
            WHERE id = $1
              AND (last_sync_status <> 'in_progress'
                   OR sync_started_at IS NULL
                   OR sync_started_at <= $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("Failed to acquire sync guard")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM provider_integrations WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check integration")?;
        if !exists {
            return Err(AppError::NotFound(format!("integration {}", id)));
        }
        Ok(false)
    }

    async fn finish_sync(&self, id: Uuid, finish: &SyncFinish) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE provider_integrations SET
                last_sync = $2,
                last_sync_status = $3,
                last_sync_message = $4,
                sync_count = sync_count + 1,
                error_count = error_count + CASE WHEN $3::text = 'error' THEN 1 ELSE 0 END,
                consecutive_empty_syncs = $5,
                sync_started_at = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(finish.finished_at)
        .bind(finish.status.as_str())
        .bind(&finish.message)
        .bind(finish.empty_streak)
        .execute(&self.pool)
        .await
        .context("Failed to record sync result")?;

        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn has_active_subscription(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM subscriptions
                WHERE provider_id = $1
                  AND status IN ('active', 'promotional')
                  AND expires_at > $2
            )
            "#,
        )
        .bind(provider_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check subscription")
    }
}
