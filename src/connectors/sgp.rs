use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use super::{
    array_field, overdue_cutoff, resolve_debtors, send_json, send_lookup, Connector,
    FetchedTitles, TitleFields,
};
use crate::errors::AppError;
use crate::models::{FetchOutcome, IntegrationConfig, SourceType};

static SGP_TITLE_FIELDS: TitleFields = TitleFields {
    id: &["id", "titulo_id"],
    customer_id: &["cliente_id", "id_cliente"],
    due_date: &["vencimento", "data_vencimento"],
    amount: &["valor_aberto", "valor"],
    linha_digitavel: &["linha_digitavel"],
    nosso_numero: &["nosso_numero"],
    codigo_barras: &["codigo_barras"],
    payment_link: &["link_boleto", "url_boleto"],
    required: &[("situacao", "aberto")],
};

struct SgpKeys<'a> {
    key: &'a str,
    secret: &'a str,
}

/// SGP REST API authenticated by an API key/secret header pair.
pub struct SgpConnector {
    client: Client,
}

impl SgpConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn keys(config: &IntegrationConfig) -> Result<SgpKeys<'_>, AppError> {
        match (config.credential("api_key"), config.credential("api_secret")) {
            (Some(key), Some(secret)) => Ok(SgpKeys { key, secret }),
            _ => Err(AppError::Configuration(
                "SGP integration requires api_key and api_secret".to_string(),
            )),
        }
    }

    fn get(&self, config: &IntegrationConfig, keys: &SgpKeys<'_>, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", config.base_url(), path))
            .header("X-API-Key", keys.key)
            .header("X-API-Secret", keys.secret)
    }

    async fn lookup_customer(
        &self,
        config: &IntegrationConfig,
        keys: &SgpKeys<'_>,
        customer_id: String,
    ) -> Result<Option<Value>, AppError> {
        let request = self.get(config, keys, &format!("/api/clientes/{}", customer_id));
        send_lookup(request, SourceType::Sgp, &customer_id, |body| body.get("cliente"))
            .await
    }
}

#[async_trait]
impl Connector for SgpConnector {
    fn source_type(&self) -> SourceType {
        SourceType::Sgp
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String) {
        let keys = match Self::keys(config) {
            Ok(keys) => keys,
            Err(e) => return (false, e.to_string()),
        };

        let request = self.get(config, &keys, "/api/auth/validate");
        match send_json(request, SourceType::Sgp, "connection test").await {
            Ok(_) => (true, "Connection to SGP established".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    async fn fetch_overdue_debtors(
        &self,
        config: &IntegrationConfig,
        today: NaiveDate,
    ) -> Result<FetchOutcome, AppError> {
        let keys = Self::keys(config)?;
        let cutoff = overdue_cutoff(today, config.min_days_overdue);
        tracing::info!("Fetching SGP titles due before {}", cutoff);

        let request = self.get(config, &keys, "/api/financeiro/titulos").query(&[
            ("situacao", "aberto".to_string()),
            ("vencimento_ate", cutoff.format("%Y-%m-%d").to_string()),
        ]);
        let body = send_json(request, SourceType::Sgp, "titles query").await?;
        let fetched =
            FetchedTitles::from_page(array_field(&body, "titulos"), &SGP_TITLE_FIELDS, cutoff);

        resolve_debtors(
            SourceType::Sgp,
            fetched,
            |_| None,
            |customer_id| self.lookup_customer(config, &keys, customer_id),
        )
        .await
    }
}
