use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

// ============ Sources ============

/// ERP systems a provider can pull delinquent customers from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Ixc,
    MkAuth,
    Sgp,
    Radiusnet,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Ixc,
        SourceType::MkAuth,
        SourceType::Sgp,
        SourceType::Radiusnet,
    ];

    /// Identifier stored in `provider_integrations.integration_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Ixc => "ixc",
            SourceType::MkAuth => "mk-auth",
            SourceType::Sgp => "sgp",
            SourceType::Radiusnet => "radiusnet",
        }
    }

    /// Upper-case label used in origin markers (`IXC`, `MK-AUTH`, ...).
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Ixc => "IXC",
            SourceType::MkAuth => "MK-AUTH",
            SourceType::Sgp => "SGP",
            SourceType::Radiusnet => "RADIUSNET",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceType::Ixc => "IXC Soft",
            SourceType::MkAuth => "MK-Auth",
            SourceType::Sgp => "SGP",
            SourceType::Radiusnet => "RadiusNet",
        }
    }

    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            SourceType::Ixc => &["token"],
            SourceType::MkAuth => &["api_token"],
            SourceType::Sgp => &["api_key", "api_secret"],
            SourceType::Radiusnet => &["username", "password"],
        }
    }

    /// Marker written into `reason`/`observations` of every imported row.
    pub fn origin_marker(&self) -> String {
        format!("Importado do {}", self.label())
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ixc" => Ok(SourceType::Ixc),
            "mk-auth" | "mkauth" => Ok(SourceType::MkAuth),
            "sgp" => Ok(SourceType::Sgp),
            "radiusnet" => Ok(SourceType::Radiusnet),
            other => Err(AppError::BadRequest(format!(
                "Unsupported integration type: {}",
                other
            ))),
        }
    }
}

// ============ Sync status ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Never,
    InProgress,
    Success,
    Error,
    Partial,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Never => "never",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::Partial => "partial",
        }
    }

    /// Lenient parse for values read back from the database.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "in_progress" => SyncStatus::InProgress,
            "success" => SyncStatus::Success,
            "error" => SyncStatus::Error,
            "partial" => SyncStatus::Partial,
            _ => SyncStatus::Never,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Client records ============

/// Billing document attached to an imported client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boleto {
    pub valor: BigDecimal,
    pub vencimento: NaiveDate,
    pub linha_digitavel: Option<String>,
    pub url_boleto: Option<String>,
    pub nosso_numero: Option<String>,
    pub id_titulo: String,
    pub codigo_barras: Option<String>,
}

/// Canonical delinquent-customer row (`clients` table).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub name: String,
    pub cpf: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub bairro: Option<String>,
    pub debt_amount: BigDecimal,
    pub reason: String,
    pub inclusion_date: NaiveDate,
    pub observations: Option<String>,
    pub risk_level: i16,
    pub is_active: bool,
    pub boletos: Json<Vec<Boleto>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Output of the field normalizer; what the importer writes.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCandidate {
    pub name: String,
    pub cpf: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub bairro: Option<String>,
    pub debt_amount: BigDecimal,
    pub risk_level: i16,
    pub reason: String,
    pub boletos: Vec<Boleto>,
}

// ============ ERP transient records ============

/// One open, overdue receivable as reported by an ERP.
#[derive(Debug, Clone, PartialEq)]
pub struct OverdueTitle {
    pub id: String,
    pub customer_id: String,
    pub due_date: NaiveDate,
    pub amount: BigDecimal,
    pub linha_digitavel: Option<String>,
    pub nosso_numero: Option<String>,
    pub codigo_barras: Option<String>,
    pub payment_link: Option<String>,
}

impl OverdueTitle {
    pub fn to_boleto(&self, url_fallback: Option<String>) -> Boleto {
        Boleto {
            valor: self.amount.clone(),
            vencimento: self.due_date,
            linha_digitavel: self.linha_digitavel.clone(),
            url_boleto: self.payment_link.clone().or(url_fallback),
            nosso_numero: self.nosso_numero.clone(),
            id_titulo: self.id.clone(),
            codigo_barras: self.codigo_barras.clone(),
        }
    }
}

/// Customer as returned by a connector, before normalization.
#[derive(Debug, Clone)]
pub struct ExternalDebtor {
    pub external_id: String,
    pub customer: Value,
    /// Sum of the aggregated titles; `None` lets the normalizer fall back to
    /// a debt field on the customer payload.
    pub debt_amount: Option<BigDecimal>,
    pub titles_count: usize,
    pub boletos: Vec<Boleto>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub debtors: Vec<ExternalDebtor>,
    /// Title records the ERP returned, before local filtering.
    pub upstream_records: usize,
    /// Titles that parsed and qualified as overdue.
    pub qualifying_titles: usize,
    pub skipped_lookups: usize,
    /// The title listing stopped before the ERP's last record.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub removed: usize,
    pub skipped: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub status: SyncStatus,
    pub message: String,
    pub clients_synced: usize,
    pub clients_created: usize,
    pub clients_updated: usize,
    pub clients_failed: usize,
    pub clients_removed: usize,
    pub synced_at: DateTime<Utc>,
}

/// Bookkeeping written back to the integration row when a run ends.
#[derive(Debug, Clone)]
pub struct SyncFinish {
    pub status: SyncStatus,
    pub message: String,
    pub finished_at: DateTime<Utc>,
    pub empty_streak: i32,
}

// ============ Integrations ============

pub const DEFAULT_MIN_DAYS_OVERDUE: i32 = 60;

pub fn default_sync_time() -> NaiveTime {
    NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_sync_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

pub mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_sync_time(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day: {}", raw)))
    }
}

/// A provider's connection to one ERP (`provider_integrations` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub integration_type: SourceType,
    pub display_name: String,
    pub api_url: String,
    pub credentials: HashMap<String, String>,
    pub is_active: bool,
    pub min_days_overdue: i32,
    pub auto_sync_enabled: bool,
    #[serde(with = "hh_mm")]
    pub auto_sync_time: NaiveTime,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub last_sync_message: Option<String>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_count: i32,
    pub error_count: i32,
    pub consecutive_empty_syncs: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationConfig {
    /// Trimmed, non-empty credential value.
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn base_url(&self) -> &str {
        self.api_url.trim().trim_end_matches('/')
    }
}

/// Integration as exposed over HTTP: credential values never leave the server.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationView {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub integration_type: SourceType,
    pub display_name: String,
    pub api_url: String,
    pub credential_keys: Vec<String>,
    pub is_active: bool,
    pub min_days_overdue: i32,
    pub auto_sync_enabled: bool,
    #[serde(with = "hh_mm")]
    pub auto_sync_time: NaiveTime,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub last_sync_message: Option<String>,
    pub sync_count: i32,
    pub error_count: i32,
}

impl From<&IntegrationConfig> for IntegrationView {
    fn from(c: &IntegrationConfig) -> Self {
        let mut credential_keys: Vec<String> = c.credentials.keys().cloned().collect();
        credential_keys.sort();
        Self {
            id: c.id,
            provider_id: c.provider_id,
            integration_type: c.integration_type,
            display_name: c.display_name.clone(),
            api_url: c.api_url.clone(),
            credential_keys,
            is_active: c.is_active,
            min_days_overdue: c.min_days_overdue,
            auto_sync_enabled: c.auto_sync_enabled,
            auto_sync_time: c.auto_sync_time,
            last_sync: c.last_sync,
            last_sync_status: c.last_sync_status,
            last_sync_message: c.last_sync_message.clone(),
            sync_count: c.sync_count,
            error_count: c.error_count,
        }
    }
}

/// Request body for creating an integration.
#[derive(Debug, Clone, Deserialize)]
pub struct NewIntegration {
    pub integration_type: SourceType,
    pub display_name: Option<String>,
    pub api_url: String,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    pub min_days_overdue: Option<i32>,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    pub auto_sync_time: Option<String>,
}

impl NewIntegration {
    /// Validates the request and builds the row to persist.
    pub fn into_config(
        self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IntegrationConfig, AppError> {
        let api_url = self.api_url.trim().to_string();
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(AppError::BadRequest(
                "api_url must start with http:// or https://".to_string(),
            ));
        }

        let missing: Vec<&str> = self
            .integration_type
            .required_credentials()
            .iter()
            .copied()
            .filter(|key| {
                self.credentials
                    .get(*key)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect();
        if !missing.is_empty() {
            return Err(AppError::BadRequest(format!(
                "Missing credentials for {}: {}",
                self.integration_type,
                missing.join(", ")
            )));
        }

        let min_days_overdue = self.min_days_overdue.unwrap_or(DEFAULT_MIN_DAYS_OVERDUE);
        if min_days_overdue < 0 {
            return Err(AppError::BadRequest(
                "min_days_overdue must be zero or greater".to_string(),
            ));
        }

        let auto_sync_time = match self.auto_sync_time.as_deref() {
            Some(raw) => parse_sync_time(raw).ok_or_else(|| {
                AppError::BadRequest(format!("auto_sync_time must be HH:MM, got '{}'", raw))
            })?,
            None => default_sync_time(),
        };

        Ok(IntegrationConfig {
            id: Uuid::new_v4(),
            provider_id,
            integration_type: self.integration_type,
            display_name: self
                .display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| self.integration_type.display_name().to_string()),
            api_url,
            credentials: self.credentials,
            is_active: true,
            min_days_overdue,
            auto_sync_enabled: self.auto_sync_enabled,
            auto_sync_time,
            last_sync: None,
            last_sync_status: SyncStatus::Never,
            last_sync_message: None,
            sync_started_at: None,
            sync_count: 0,
            error_count: 0,
            consecutive_empty_syncs: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoSyncSettings {
    pub enabled: bool,
    pub sync_time: Option<String>,
}

// ============ Subscriptions ============

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub provider_id: Uuid,
    /// `active`, `promotional`, `expired` or `cancelled`.
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status.as_str(), "active" | "promotional")
            && self.expires_at.map(|at| at > now).unwrap_or(false)
    }
}
