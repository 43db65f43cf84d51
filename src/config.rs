use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Timeout applied to every outbound ERP call.
    pub erp_http_timeout_secs: u64,
    /// Self-hosted ERPs (IXC in particular) often run with self-signed certificates.
    pub erp_accept_invalid_certs: bool,
    pub scheduler_enabled: bool,
    pub scheduler_tick_secs: u64,
    pub scheduler_window_minutes: i64,
    pub manual_sync_cooldown_secs: u64,
    /// Consecutive empty upstream syncs required before a full reconciliation.
    pub reconcile_empty_confirmations: u32,
    /// An `in_progress` marker older than this may be taken over by a new run.
    pub sync_stale_after_minutes: i64,
    pub payment_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/isp_sync".to_string(),
            port: 3000,
            erp_http_timeout_secs: 30,
            erp_accept_invalid_certs: false,
            scheduler_enabled: true,
            scheduler_tick_secs: 60,
            scheduler_window_minutes: 2,
            manual_sync_cooldown_secs: 60,
            reconcile_empty_confirmations: 2,
            sync_stale_after_minutes: 30,
            payment_required: false,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be true or false, got '{}'", name, other),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: env_or("PORT", "3000")
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            erp_http_timeout_secs: env_or("ERP_HTTP_TIMEOUT_SECS", "30")
                .parse()
                .map_err(|_| anyhow::anyhow!("ERP_HTTP_TIMEOUT_SECS must be a number"))
                .and_then(|secs: u64| {
                    if !(1..=300).contains(&secs) {
                        anyhow::bail!("ERP_HTTP_TIMEOUT_SECS must be between 1 and 300");
                    }
                    Ok(secs)
                })?,
            erp_accept_invalid_certs: parse_bool(
                "ERP_ACCEPT_INVALID_CERTS",
                &env_or("ERP_ACCEPT_INVALID_CERTS", "false"),
            )?,
            scheduler_enabled: parse_bool(
                "SCHEDULER_ENABLED",
                &env_or("SCHEDULER_ENABLED", "true"),
            )?,
            scheduler_tick_secs: env_or("SCHEDULER_TICK_SECS", "60")
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULER_TICK_SECS must be a number"))
                .and_then(|secs: u64| {
                    if secs == 0 {
                        anyhow::bail!("SCHEDULER_TICK_SECS must be greater than zero");
                    }
                    Ok(secs)
                })?,
            scheduler_window_minutes: env_or("SCHEDULER_WINDOW_MINUTES", "2")
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULER_WINDOW_MINUTES must be a number"))
                .and_then(|minutes: i64| {
                    if !(0..=60).contains(&minutes) {
                        anyhow::bail!("SCHEDULER_WINDOW_MINUTES must be between 0 and 60");
                    }
                    Ok(minutes)
                })?,
            manual_sync_cooldown_secs: env_or("MANUAL_SYNC_COOLDOWN_SECS", "60")
                .parse()
                .map_err(|_| anyhow::anyhow!("MANUAL_SYNC_COOLDOWN_SECS must be a number"))?,
            reconcile_empty_confirmations: env_or("RECONCILE_EMPTY_CONFIRMATIONS", "2")
                .parse()
                .map_err(|_| anyhow::anyhow!("RECONCILE_EMPTY_CONFIRMATIONS must be a number"))
                .and_then(|n: u32| {
                    if n == 0 {
                        anyhow::bail!("RECONCILE_EMPTY_CONFIRMATIONS must be at least 1");
                    }
                    Ok(n)
                })?,
            sync_stale_after_minutes: env_or("SYNC_STALE_AFTER_MINUTES", "30")
                .parse()
                .map_err(|_| anyhow::anyhow!("SYNC_STALE_AFTER_MINUTES must be a number"))
                .and_then(|minutes: i64| {
                    if minutes <= 0 {
                        anyhow::bail!("SYNC_STALE_AFTER_MINUTES must be positive");
                    }
                    Ok(minutes)
                })?,
            payment_required: parse_bool(
                "PAYMENT_REQUIRED",
                &env_or("PAYMENT_REQUIRED", "false"),
            )?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("ERP HTTP timeout: {}s", config.erp_http_timeout_secs);
        if config.erp_accept_invalid_certs {
            tracing::warn!("ERP TLS certificate validation is DISABLED");
        }
        tracing::debug!(
            "Scheduler: enabled={} tick={}s window={}min",
            config.scheduler_enabled,
            config.scheduler_tick_secs,
            config.scheduler_window_minutes
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
