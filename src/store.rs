//! Storage seams used by the sync engine, plus an in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CanonicalCandidate, ClientRecord, IntegrationConfig, Subscription, SyncFinish, SyncStatus,
};
use crate::normalizer::digits_only;

#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Active client of the provider whose cpf matches once reduced to digits.
    async fn find_active_by_cpf(
        &self,
        provider_id: Uuid,
        cpf_digits: &str,
    ) -> Result<Option<ClientRecord>, AppError>;

    async fn insert_client(&self, client: &ClientRecord) -> Result<(), AppError>;

    /// Refreshes the importer-owned fields; `None` contact fields keep the
    /// stored values.
    async fn update_imported_fields(
        &self,
        id: Uuid,
        candidate: &CanonicalCandidate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Active clients whose reason or observations contain `marker`
    /// (case-insensitive).
    async fn list_active_imported(
        &self,
        provider_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ClientRecord>, AppError>;

    /// Soft delete. Returns false when the row was already inactive.
    async fn deactivate_client(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get_integration(
        &self,
        provider_id: Uuid,
        id: Uuid,
    ) -> Result<Option<IntegrationConfig>, AppError>;

    async fn list_integrations(&self, provider_id: Uuid)
        -> Result<Vec<IntegrationConfig>, AppError>;

    /// Fails with `Conflict` when the provider already has this source.
    async fn create_integration(&self, config: &IntegrationConfig) -> Result<(), AppError>;

    async fn delete_integration(&self, provider_id: Uuid, id: Uuid) -> Result<bool, AppError>;

    async fn update_auto_sync(
        &self,
        provider_id: Uuid,
        id: Uuid,
        enabled: bool,
        sync_time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Active integrations with auto-sync turned on, across all providers.
    async fn list_auto_sync_enabled(&self) -> Result<Vec<IntegrationConfig>, AppError>;

    /// Atomically moves the integration into `in_progress`. Returns false when
    /// another run holds it and started after `stale_before`.
    async fn try_begin_sync(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn finish_sync(&self, id: Uuid, finish: &SyncFinish) -> Result<(), AppError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn has_active_subscription(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

/// Everything the sync service and HTTP layer need from storage.
pub trait SyncStore: ClientStore + IntegrationStore + SubscriptionStore {}

impl<T: ClientStore + IntegrationStore + SubscriptionStore> SyncStore for T {}

// ============ In-memory store ============

#[derive(Default)]
struct MemoryState {
    clients: Vec<ClientRecord>,
    integrations: Vec<IntegrationConfig>,
    subscriptions: Vec<Subscription>,
    failing_cpfs: HashSet<String>,
}

/// Process-local store with the same semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clients(&self) -> Vec<ClientRecord> {
        self.state.lock().await.clients.clone()
    }

    pub async fn seed_client(&self, client: ClientRecord) {
        self.state.lock().await.clients.push(client);
    }

    pub async fn seed_integration(&self, config: IntegrationConfig) {
        self.state.lock().await.integrations.push(config);
    }

    pub async fn integration(&self, id: Uuid) -> Option<IntegrationConfig> {
        self.state
            .lock()
            .await
            .integrations
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub async fn add_subscription(&self, subscription: Subscription) {
        self.state.lock().await.subscriptions.push(subscription);
    }

    /// Makes every write for this cpf fail, to exercise per-record error paths.
    pub async fn fail_writes_for(&self, cpf_digits: &str) {
        self.state
            .lock()
            .await
            .failing_cpfs
            .insert(cpf_digits.to_string());
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn find_active_by_cpf(
        &self,
        provider_id: Uuid,
        cpf_digits: &str,
    ) -> Result<Option<ClientRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .iter()
            .find(|c| {
                c.provider_id == provider_id && c.is_active && digits_only(&c.cpf) == cpf_digits
            })
            .cloned())
    }

    async fn insert_client(&self, client: &ClientRecord) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.failing_cpfs.contains(&client.cpf) {
            return Err(AppError::InternalError(format!(
                "simulated write failure for {}",
                client.cpf
            )));
        }
        let duplicate = state.clients.iter().any(|c| {
            c.provider_id == client.provider_id
                && c.is_active
                && digits_only(&c.cpf) == digits_only(&client.cpf)
        });
        if duplicate {
            return Err(AppError::Conflict(
                "an active client with this cpf already exists".to_string(),
            ));
        }
        state.clients.push(client.clone());
        Ok(())
    }

    async fn update_imported_fields(
        &self,
        id: Uuid,
        candidate: &CanonicalCandidate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.failing_cpfs.contains(&candidate.cpf) {
            return Err(AppError::InternalError(format!(
                "simulated write failure for {}",
                candidate.cpf
            )));
        }
        let client = state
            .clients
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::NotFound(format!("client {}", id)))?;

        client.name = candidate.name.clone();
        client.debt_amount = candidate.debt_amount.clone();
        client.reason = candidate.reason.clone();
        client.risk_level = candidate.risk_level;
        client.boletos.0 = candidate.boletos.clone();
        if candidate.email.is_some() {
            client.email = candidate.email.clone();
        }
        if candidate.phone.is_some() {
            client.phone = candidate.phone.clone();
        }
        if candidate.address.is_some() {
            client.address = candidate.address.clone();
        }
        if candidate.bairro.is_some() {
            client.bairro = candidate.bairro.clone();
        }
        client.updated_at = now;
        Ok(())
    }

    async fn list_active_imported(
        &self,
        provider_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ClientRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .iter()
            .filter(|c| c.provider_id == provider_id && c.is_active)
            .filter(|c| {
                contains_ignore_case(&c.reason, marker)
                    || c.observations
                        .as_deref()
                        .map(|o| contains_ignore_case(o, marker))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn deactivate_client(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.clients.iter_mut().find(|c| c.id == id && c.is_active) {
            Some(client) => {
                client.is_active = false;
                client.deleted_at = Some(now);
                client.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn get_integration(
        &self,
        provider_id: Uuid,
        id: Uuid,
    ) -> Result<Option<IntegrationConfig>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .integrations
            .iter()
            .find(|i| i.id == id && i.provider_id == provider_id)
            .cloned())
    }

    async fn list_integrations(
        &self,
        provider_id: Uuid,
    ) -> Result<Vec<IntegrationConfig>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .integrations
            .iter()
            .filter(|i| i.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn create_integration(&self, config: &IntegrationConfig) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.integrations.iter().any(|i| {
            i.provider_id == config.provider_id && i.integration_type == config.integration_type
        }) {
            return Err(AppError::Conflict(format!(
                "{} integration already configured for this provider",
                config.integration_type
            )));
        }
        state.integrations.push(config.clone());
        Ok(())
    }

    async fn delete_integration(&self, provider_id: Uuid, id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let before = state.integrations.len();
        state
            .integrations
            .retain(|i| !(i.id == id && i.provider_id == provider_id));
        Ok(state.integrations.len() < before)
    }

    async fn update_auto_sync(
        &self,
        provider_id: Uuid,
        id: Uuid,
        enabled: bool,
        sync_time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state
            .integrations
            .iter_mut()
            .find(|i| i.id == id && i.provider_id == provider_id)
        {
            Some(integration) => {
                integration.auto_sync_enabled = enabled;
                integration.auto_sync_time = sync_time;
                integration.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_auto_sync_enabled(&self) -> Result<Vec<IntegrationConfig>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .integrations
            .iter()
            .filter(|i| i.is_active && i.auto_sync_enabled)
            .cloned()
            .collect())
    }

    async fn try_begin_sync(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let integration = state
            .integrations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| AppError::NotFound(format!("integration {}", id)))?;

        let held = integration.last_sync_status == SyncStatus::InProgress
            && integration
                .sync_started_at
                .map(|started| started > stale_before)
                .unwrap_or(false);
        if held {
            return Ok(false);
        }

        integration.last_sync_status = SyncStatus::InProgress;
        integration.sync_started_at = Some(now);
        integration.updated_at = now;
        Ok(true)
    }

    async fn finish_sync(&self, id: Uuid, finish: &SyncFinish) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let integration = state
            .integrations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| AppError::NotFound(format!("integration {}", id)))?;

        integration.last_sync = Some(finish.finished_at);
        integration.last_sync_status = finish.status;
        integration.last_sync_message = Some(finish.message.clone());
        integration.sync_count += 1;
        if finish.status == SyncStatus::Error {
            integration.error_count += 1;
        }
        integration.consecutive_empty_syncs = finish.empty_streak;
        integration.sync_started_at = None;
        integration.updated_at = finish.finished_at;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn has_active_subscription(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .any(|s| s.provider_id == provider_id && s.is_entitled(now)))
    }
}
