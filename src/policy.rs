use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::store::SubscriptionStore;

/// System-wide switches that gate provider operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPolicy {
    pub payment_required: bool,
}

impl SystemPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            payment_required: config.payment_required,
        }
    }

    pub async fn ensure_entitled<S: SubscriptionStore + ?Sized>(
        &self,
        store: &S,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !self.payment_required {
            return Ok(());
        }
        if store.has_active_subscription(provider_id, now).await? {
            return Ok(());
        }
        Err(AppError::PaymentRequired(
            "An active subscription is required for this operation".to_string(),
        ))
    }
}
