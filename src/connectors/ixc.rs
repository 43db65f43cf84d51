use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    array_field, overdue_cutoff, resolve_debtors, send_json, send_lookup, Connector,
    FetchedTitles, TitleFields,
};
use crate::errors::AppError;
use crate::models::{FetchOutcome, IntegrationConfig, SourceType};
use crate::normalizer::value_text;

const PAGE_SIZE: u32 = 1000;
const MAX_PAGES: u32 = 50;

static IXC_TITLE_FIELDS: TitleFields = TitleFields {
    id: &["id"],
    customer_id: &["id_cliente", "cliente_id"],
    due_date: &["data_vencimento"],
    amount: &["valor_aberto", "valor"],
    linha_digitavel: &["linha_digitavel"],
    nosso_numero: &["nn_boleto", "nosso_numero"],
    codigo_barras: &["codigo_barras"],
    payment_link: &["gateway_link"],
    required: &[("status", "A"), ("liberado", "S")],
};

/// IXC Soft webservice (`/webservice/v1`). Every call is a POST carrying the
/// `ixcsoft: listar` header and a grid-style query body.
pub struct IxcConnector {
    client: Client,
}

impl IxcConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// `Basic base64(ID:HASH)`; malformed tokens never reach the network.
    fn authorization(config: &IntegrationConfig) -> Result<String, AppError> {
        let token = config.credential("token").ok_or_else(|| {
            AppError::Configuration("IXC integration has no token configured".to_string())
        })?;
        if !token.contains(':') {
            return Err(AppError::Configuration(
                "IXC token must be in the format ID:HASH".to_string(),
            ));
        }
        Ok(format!("Basic {}", STANDARD.encode(token)))
    }

    async fn post(
        &self,
        config: &IntegrationConfig,
        auth: &str,
        resource: &str,
        body: &Value,
        what: &str,
    ) -> Result<Value, AppError> {
        let request = self
            .client
            .post(format!("{}/{}", config.base_url(), resource))
            .header("Authorization", auth)
            .header("ixcsoft", "listar")
            .json(body);

        let body = send_json(request, SourceType::Ixc, what).await?;
        reject_error_envelope(&body)?;
        Ok(body)
    }

    /// Pages through `fn_areceber`. Without a `total` in the response, a full
    /// page means there may be more.
    async fn fetch_titles(
        &self,
        config: &IntegrationConfig,
        auth: &str,
        cutoff: NaiveDate,
    ) -> Result<FetchedTitles, AppError> {
        let grid_param = json!([
            {"TB": "fn_areceber.status", "OP": "=", "P": "A"},
            {"TB": "fn_areceber.liberado", "OP": "=", "P": "S"}
        ])
        .to_string();

        let mut fetched = FetchedTitles::default();

        for page in 1..=MAX_PAGES {
            let body = json!({
                "qtype": "fn_areceber.data_vencimento",
                "query": cutoff.format("%Y-%m-%d").to_string(),
                "oper": "<",
                "page": page.to_string(),
                "rp": PAGE_SIZE.to_string(),
                "sortname": "fn_areceber.data_vencimento",
                "sortorder": "asc",
                "grid_param": grid_param,
            });

            let response = self
                .post(config, auth, "fn_areceber", &body, "titles query")
                .await?;
            let records = array_field(&response, "registros");
            if records.is_empty() {
                break;
            }
            fetched.push_page(records, &IXC_TITLE_FIELDS, cutoff);

            let total = response
                .get("total")
                .and_then(value_text)
                .and_then(|t| t.parse::<usize>().ok());
            let more = match total {
                Some(total) => fetched.upstream_records < total,
                None => records.len() >= PAGE_SIZE as usize,
            };
            tracing::debug!(
                "IXC titles page {}: {} records so far (total {:?})",
                page,
                fetched.upstream_records,
                total
            );
            if !more {
                break;
            }
            if page == MAX_PAGES {
                tracing::warn!(
                    "IXC titles query stopped at page limit ({} pages); listing is incomplete",
                    MAX_PAGES
                );
                fetched.truncated = true;
            }
        }

        Ok(fetched)
    }

    async fn lookup_customer(
        &self,
        config: &IntegrationConfig,
        auth: &str,
        customer_id: String,
    ) -> Result<Option<Value>, AppError> {
        let body = json!({
            "qtype": "cliente.id",
            "query": customer_id,
            "oper": "=",
            "page": "1",
            "rp": "1",
        });

        let request = self
            .client
            .post(format!("{}/cliente", config.base_url()))
            .header("Authorization", auth)
            .header("ixcsoft", "listar")
            .json(&body);

        send_lookup(request, SourceType::Ixc, &customer_id, |body| {
            array_field(body, "registros").first()
        })
        .await
    }
}

/// IXC reports failures as `200 {"type": "error", "mensagem": ...}`.
fn reject_error_envelope(body: &Value) -> Result<(), AppError> {
    if body.get("type").and_then(|t| t.as_str()) == Some("error") {
        let message = body
            .get("mensagem")
            .and_then(value_text)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(AppError::Configuration(format!("IXC rejected the request: {}", message)));
    }
    Ok(())
}

/// Subscriber-portal URL used when a title has no gateway link.
pub fn boleto_url(api_url: &str, title_id: &str) -> String {
    let base = api_url.trim().trim_end_matches('/');
    let base = base.strip_suffix("/webservice/v1").unwrap_or(base);
    format!("{}/central_assinante_web/boleto/{}", base, title_id)
}

#[async_trait]
impl Connector for IxcConnector {
    fn source_type(&self) -> SourceType {
        SourceType::Ixc
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String) {
        let auth = match Self::authorization(config) {
            Ok(auth) => auth,
            Err(e) => return (false, e.to_string()),
        };

        let body = json!({
            "qtype": "cliente.id",
            "query": "1",
            "oper": ">=",
            "page": "1",
            "rp": "1",
        });
        match self
            .post(config, &auth, "cliente", &body, "connection test")
            .await
        {
            Ok(_) => (true, "Connection to IXC established".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    async fn fetch_overdue_debtors(
        &self,
        config: &IntegrationConfig,
        today: NaiveDate,
    ) -> Result<FetchOutcome, AppError> {
        let auth = Self::authorization(config)?;
        let cutoff = overdue_cutoff(today, config.min_days_overdue);
        tracing::info!("Fetching IXC titles due before {}", cutoff);

        let fetched = self.fetch_titles(config, &auth, cutoff).await?;
        let api_url = config.api_url.clone();

        resolve_debtors(
            SourceType::Ixc,
            fetched,
            |title| Some(boleto_url(&api_url, &title.id)),
            |customer_id| self.lookup_customer(config, &auth, customer_id),
        )
        .await
    }
}
