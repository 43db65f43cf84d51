use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppError;

/// Fixed-window limiter for manual operations, one window per provider.
/// Applied to manual syncs and connection tests.
#[derive(Clone)]
pub struct ProviderRateLimiter {
    windows: Cache<Uuid, ()>,
    window: Duration,
}

impl ProviderRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(window.max(Duration::from_millis(1)))
                .build(),
            window,
        }
    }

    /// Opens a window for the provider, or fails with `RateLimited` when one
    /// is already open.
    pub async fn check(&self, provider_id: Uuid) -> Result<(), AppError> {
        if self.window.is_zero() {
            return Ok(());
        }

        let entry = self.windows.entry(provider_id).or_insert(()).await;
        if entry.is_fresh() {
            Ok(())
        } else {
            tracing::warn!("Manual operation rate limited for provider {}", provider_id);
            Err(AppError::RateLimited(format!(
                "Only one manual operation per {} seconds is allowed",
                self.window.as_secs()
            )))
        }
    }
}
