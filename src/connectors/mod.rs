//! ERP connectors: one per supported source, all producing `ExternalDebtor`s
//! out of the ERP's overdue receivables.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration, NaiveDate};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use crate::errors::AppError;
use crate::models::{ExternalDebtor, FetchOutcome, IntegrationConfig, OverdueTitle, SourceType};
use crate::normalizer::{first_amount, first_text, parse_date};

pub mod ixc;
pub mod mkauth;
pub mod radiusnet;
pub mod sgp;

pub use ixc::IxcConnector;
pub use mkauth::MkAuthConnector;
pub use radiusnet::RadiusNetConnector;
pub use sgp::SgpConnector;

/// Number of earliest-due titles summed into a customer's debt.
pub const OLDEST_TITLES_LIMIT: usize = 2;

#[async_trait]
pub trait Connector: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Probes the ERP with the stored credentials. Never fails; the outcome
    /// is reported as `(ok, message)`.
    async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String);

    async fn fetch_overdue_debtors(
        &self,
        config: &IntegrationConfig,
        today: NaiveDate,
    ) -> Result<FetchOutcome, AppError>;
}

/// Connectors keyed by source.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<SourceType, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four built-in connectors sharing one HTTP client.
    pub fn with_defaults(client: Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IxcConnector::new(client.clone())));
        registry.register(Arc::new(MkAuthConnector::new(client.clone())));
        registry.register(Arc::new(SgpConnector::new(client.clone())));
        registry.register(Arc::new(RadiusNetConnector::new(client)));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.source_type(), connector);
    }

    pub fn get(&self, source: SourceType) -> Result<Arc<dyn Connector>, AppError> {
        self.connectors.get(&source).cloned().ok_or_else(|| {
            AppError::Configuration(format!("No connector registered for {}", source))
        })
    }
}

pub fn build_http_client(
    timeout: std::time::Duration,
    accept_invalid_certs: bool,
) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?;
    Ok(client)
}

/// Titles due strictly before this date are overdue.
pub fn overdue_cutoff(today: NaiveDate, min_days_overdue: i32) -> NaiveDate {
    today - Duration::days(i64::from(min_days_overdue.max(0)))
}

// ============ Title parsing ============

/// Candidate keys for each title field in a source's payload.
#[derive(Debug)]
pub struct TitleFields {
    pub id: &'static [&'static str],
    pub customer_id: &'static [&'static str],
    pub due_date: &'static [&'static str],
    pub amount: &'static [&'static str],
    pub linha_digitavel: &'static [&'static str],
    pub nosso_numero: &'static [&'static str],
    pub codigo_barras: &'static [&'static str],
    pub payment_link: &'static [&'static str],
    /// `(key, value)` pairs a title must match when the key is present,
    /// e.g. open status or released flag.
    pub required: &'static [(&'static str, &'static str)],
}

pub fn parse_title(raw: &Value, fields: &TitleFields) -> Option<OverdueTitle> {
    for (key, expected) in fields.required {
        if let Some(actual) = raw.get(*key).and_then(|v| v.as_str()) {
            if !actual.trim().eq_ignore_ascii_case(expected) {
                return None;
            }
        }
    }

    let due_date = fields
        .due_date
        .iter()
        .find_map(|key| raw.get(*key).and_then(parse_date))?;

    Some(OverdueTitle {
        id: first_text(raw, fields.id)?,
        customer_id: first_text(raw, fields.customer_id)?,
        due_date,
        amount: first_amount(raw, fields.amount)?,
        linha_digitavel: first_text(raw, fields.linha_digitavel),
        nosso_numero: first_text(raw, fields.nosso_numero),
        codigo_barras: first_text(raw, fields.codigo_barras),
        payment_link: first_text(raw, fields.payment_link),
    })
}

pub fn qualifies(title: &OverdueTitle, cutoff: NaiveDate) -> bool {
    title.due_date < cutoff && title.amount > BigDecimal::from(0)
}

/// Parses a page of raw titles and keeps the overdue ones. The server-side
/// filter is not trusted.
pub fn collect_qualifying(
    raw_titles: &[Value],
    fields: &TitleFields,
    cutoff: NaiveDate,
) -> Vec<OverdueTitle> {
    let mut dropped = 0usize;
    let titles: Vec<OverdueTitle> = raw_titles
        .iter()
        .filter_map(|raw| {
            let title = parse_title(raw, fields).filter(|t| qualifies(t, cutoff));
            if title.is_none() {
                dropped += 1;
            }
            title
        })
        .collect();

    if dropped > 0 {
        tracing::debug!("Dropped {} non-qualifying titles", dropped);
    }
    titles
}

/// Titles a connector listed from the ERP.
#[derive(Debug, Default)]
pub struct FetchedTitles {
    pub titles: Vec<OverdueTitle>,
    /// Records the ERP returned, qualifying or not.
    pub upstream_records: usize,
    /// Listing stopped before the ERP's last record.
    pub truncated: bool,
}

impl FetchedTitles {
    /// Single-response listing.
    pub fn from_page(raw_titles: &[Value], fields: &TitleFields, cutoff: NaiveDate) -> Self {
        let mut fetched = Self::default();
        fetched.push_page(raw_titles, fields, cutoff);
        fetched
    }

    pub fn push_page(&mut self, raw_titles: &[Value], fields: &TitleFields, cutoff: NaiveDate) {
        self.upstream_records += raw_titles.len();
        self.titles.extend(collect_qualifying(raw_titles, fields, cutoff));
    }
}

pub fn group_by_customer(titles: Vec<OverdueTitle>) -> BTreeMap<String, Vec<OverdueTitle>> {
    let mut grouped: BTreeMap<String, Vec<OverdueTitle>> = BTreeMap::new();
    for title in titles {
        grouped
            .entry(title.customer_id.clone())
            .or_default()
            .push(title);
    }
    grouped
}

/// Earliest-due `OLDEST_TITLES_LIMIT` titles; ties broken by title id so the
/// result does not depend on input order.
pub fn select_oldest(mut titles: Vec<OverdueTitle>) -> Vec<OverdueTitle> {
    titles.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
    titles.truncate(OLDEST_TITLES_LIMIT);
    titles
}

pub fn aggregate(titles: &[OverdueTitle]) -> BigDecimal {
    titles
        .iter()
        .fold(BigDecimal::from(0), |acc, t| acc + &t.amount)
}

/// Groups qualifying titles per customer, aggregates the oldest ones and
/// looks each customer up.
///
/// `lookup` yields `Ok(None)` to skip a customer; an `Err` aborts the run.
pub(crate) async fn resolve_debtors<U, F, Fut>(
    source: SourceType,
    fetched: FetchedTitles,
    url_fallback: U,
    mut lookup: F,
) -> Result<FetchOutcome, AppError>
where
    U: Fn(&OverdueTitle) -> Option<String>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Option<Value>, AppError>>,
{
    let mut outcome = FetchOutcome {
        upstream_records: fetched.upstream_records,
        qualifying_titles: fetched.titles.len(),
        truncated: fetched.truncated,
        ..Default::default()
    };
    if outcome.upstream_records > 0 && outcome.qualifying_titles == 0 {
        tracing::warn!(
            "{} returned {} title(s) but none qualified as overdue",
            source.label(),
            outcome.upstream_records
        );
    }

    for (customer_id, customer_titles) in group_by_customer(fetched.titles) {
        let oldest = select_oldest(customer_titles);

        match lookup(customer_id.clone()).await? {
            Some(customer) => {
                outcome.debtors.push(ExternalDebtor {
                    external_id: customer_id,
                    customer,
                    debt_amount: Some(aggregate(&oldest)),
                    titles_count: oldest.len(),
                    boletos: oldest.iter().map(|t| t.to_boleto(url_fallback(t))).collect(),
                });
            }
            None => {
                tracing::warn!(
                    "{} customer {} could not be loaded; skipping",
                    source.label(),
                    customer_id
                );
                outcome.skipped_lookups += 1;
            }
        }
    }

    tracing::info!(
        "{}: {} of {} titles qualifying, {} debtors resolved, {} lookups skipped",
        source.label(),
        outcome.qualifying_titles,
        outcome.upstream_records,
        outcome.debtors.len(),
        outcome.skipped_lookups
    );
    Ok(outcome)
}

// ============ HTTP helpers ============

pub(crate) fn transport_error(source: SourceType, what: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout(format!("{} {} request timed out", source.label(), what))
    } else {
        AppError::ExternalApiError(format!("{} {} request failed: {}", source.label(), what, err))
    }
}

/// Reads a JSON body from a primary (non-lookup) call. Auth rejections become
/// `Configuration`, other non-success statuses `ExternalApiError`.
pub(crate) async fn read_json(
    response: Response,
    source: SourceType,
    what: &str,
) -> Result<Value, AppError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::warn!("{} rejected credentials on {} ({})", source.label(), what, status);
        return Err(AppError::Configuration(format!(
            "{} rejected the credentials ({})",
            source.label(),
            status
        )));
    }
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::error!("{} {} returned error {}: {}", source.label(), what, status, error_text);
        return Err(AppError::ExternalApiError(format!(
            "{} {} returned status {}",
            source.label(),
            what,
            status
        )));
    }

    response.json::<Value>().await.map_err(|e| {
        AppError::ExternalApiError(format!(
            "Failed to parse {} {} response: {}",
            source.label(),
            what,
            e
        ))
    })
}

pub(crate) async fn send_json(
    request: RequestBuilder,
    source: SourceType,
    what: &str,
) -> Result<Value, AppError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(source, what, e))?;
    read_json(response, source, what).await
}

/// Customer lookup: transport failures propagate, anything else that does not
/// yield a non-empty object through `extract` is a skip.
pub(crate) async fn send_lookup<E>(
    request: RequestBuilder,
    source: SourceType,
    customer_id: &str,
    extract: E,
) -> Result<Option<Value>, AppError>
where
    E: FnOnce(&Value) -> Option<&Value>,
{
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(source, "customer lookup", e))?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(
            "{} customer {} lookup returned {}",
            source.label(),
            customer_id,
            status
        );
        return Ok(None);
    }

    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(
                "{} customer {} lookup had an unreadable body: {}",
                source.label(),
                customer_id,
                e
            );
            return Ok(None);
        }
    };

    Ok(non_empty_object(extract(&body)))
}

pub(crate) fn non_empty_object(value: Option<&Value>) -> Option<Value> {
    value
        .filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
        .cloned()
}

/// Array under `key`, or an empty slice when the envelope is missing.
pub(crate) fn array_field<'a>(body: &'a Value, key: &str) -> &'a [Value] {
    body.get(key)
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn title(id: &str, customer: &str, due: &str, amount: &str) -> OverdueTitle {
        OverdueTitle {
            id: id.to_string(),
            customer_id: customer.to_string(),
            due_date: NaiveDate::parse_from_str(due, "%Y-%m-%d").unwrap(),
            amount: BigDecimal::from_str(amount).unwrap(),
            linha_digitavel: None,
            nosso_numero: None,
            codigo_barras: None,
            payment_link: None,
        }
    }

    #[test]
    fn test_cutoff_subtracts_min_days() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        assert_eq!(
            overdue_cutoff(today, 60),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(overdue_cutoff(today, 0), today);
    }

    #[test]
    fn test_select_oldest_keeps_two_earliest() {
        let titles = vec![
            title("3", "10", "2024-03-01", "200"),
            title("1", "10", "2024-01-01", "50"),
            title("2", "10", "2024-02-01", "80"),
        ];
        let oldest = select_oldest(titles);
        let ids: Vec<&str> = oldest.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(aggregate(&oldest), BigDecimal::from(130));
    }

    #[test]
    fn test_qualifies_requires_strictly_before_cutoff_and_positive() {
        let cutoff = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(qualifies(&title("1", "1", "2024-04-30", "1"), cutoff));
        assert!(!qualifies(&title("1", "1", "2024-05-01", "1"), cutoff));
        assert!(!qualifies(&title("1", "1", "2024-01-01", "0"), cutoff));
    }

    #[test]
    fn test_parse_title_respects_required_fields() {
        static FIELDS: TitleFields = TitleFields {
            id: &["id"],
            customer_id: &["cliente_id"],
            due_date: &["vencimento"],
            amount: &["valor"],
            linha_digitavel: &[],
            nosso_numero: &[],
            codigo_barras: &[],
            payment_link: &[],
            required: &[("status", "aberto")],
        };

        let open = serde_json::json!({"id": 1, "cliente_id": 7, "vencimento": "2024-01-10", "valor": "10,50", "status": "ABERTO"});
        let parsed = parse_title(&open, &FIELDS).unwrap();
        assert_eq!(parsed.customer_id, "7");
        assert_eq!(parsed.amount, BigDecimal::from_str("10.50").unwrap());

        let paid = serde_json::json!({"id": 2, "cliente_id": 7, "vencimento": "2024-01-10", "valor": "10", "status": "pago"});
        assert!(parse_title(&paid, &FIELDS).is_none());
    }

    #[tokio::test]
    async fn test_resolve_debtors_counts_skipped_lookups() {
        let fetched = FetchedTitles {
            titles: vec![
                title("1", "10", "2024-01-01", "50"),
                title("2", "20", "2024-01-01", "70"),
            ],
            upstream_records: 3,
            truncated: false,
        };
        let outcome = resolve_debtors(
            SourceType::Sgp,
            fetched,
            |_| None,
            |id| async move {
                if id == "10" {
                    Ok(Some(serde_json::json!({"nome": "A"})))
                } else {
                    Ok(None)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.upstream_records, 3);
        assert_eq!(outcome.qualifying_titles, 2);
        assert_eq!(outcome.debtors.len(), 1);
        assert_eq!(outcome.skipped_lookups, 1);
        assert_eq!(outcome.debtors[0].debt_amount, Some(BigDecimal::from(50)));
    }

    #[test]
    fn test_fetched_titles_count_every_upstream_record() {
        static FIELDS: TitleFields = TitleFields {
            id: &["id"],
            customer_id: &["cliente_id"],
            due_date: &["vencimento"],
            amount: &["valor"],
            linha_digitavel: &[],
            nosso_numero: &[],
            codigo_barras: &[],
            payment_link: &[],
            required: &[],
        };
        let cutoff = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let mut fetched = FetchedTitles::from_page(
            &[
                serde_json::json!({"id": 1, "cliente_id": 7, "vencimento": "2024-01-10", "valor": "10"}),
                serde_json::json!({"id": 2, "cliente_id": 7, "vencimento": "sem data", "valor": "10"}),
            ],
            &FIELDS,
            cutoff,
        );
        fetched.push_page(
            &[serde_json::json!({"id": 3, "cliente_id": 8, "vencimento": "2024-06-01", "valor": "10"})],
            &FIELDS,
            cutoff,
        );

        assert_eq!(fetched.upstream_records, 3);
        assert_eq!(fetched.titles.len(), 1);
        assert!(!fetched.truncated);
    }

    #[test]
    fn test_registry_rejects_unregistered_source() {
        let registry = ConnectorRegistry::new();
        assert!(matches!(
            registry.get(SourceType::Ixc),
            Err(AppError::Configuration(_))
        ));
    }
}
