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

static MKAUTH_TITLE_FIELDS: TitleFields = TitleFields {
    id: &["id", "titulo_id"],
    customer_id: &["cliente_id", "client_id"],
    due_date: &["vencimento", "due_date"],
    amount: &["valor_aberto", "valor", "amount"],
    linha_digitavel: &["linha_digitavel"],
    nosso_numero: &["nosso_numero"],
    codigo_barras: &["codigo_barras"],
    payment_link: &["link_boleto", "url_boleto"],
    required: &[("status", "aberto")],
};

/// MK-Auth REST API (`/api/v1`), bearer-token authenticated.
pub struct MkAuthConnector {
    client: Client,
}

impl MkAuthConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn token(config: &IntegrationConfig) -> Result<&str, AppError> {
        config.credential("api_token").ok_or_else(|| {
            AppError::Configuration("MK-Auth integration has no api_token configured".to_string())
        })
    }

    fn get(&self, config: &IntegrationConfig, token: &str, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", config.base_url(), path))
            .bearer_auth(token)
    }

    async fn lookup_customer(
        &self,
        config: &IntegrationConfig,
        token: &str,
        customer_id: String,
    ) -> Result<Option<Value>, AppError> {
        let request = self.get(config, token, &format!("/api/v1/clientes/{}", customer_id));
        send_lookup(request, SourceType::MkAuth, &customer_id, |body| body.get("data"))
            .await
    }
}

#[async_trait]
impl Connector for MkAuthConnector {
    fn source_type(&self) -> SourceType {
        SourceType::MkAuth
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String) {
        let token = match Self::token(config) {
            Ok(token) => token,
            Err(e) => return (false, e.to_string()),
        };

        let request = self.get(config, token, "/api/v1/health");
        match send_json(request, SourceType::MkAuth, "connection test").await {
            Ok(_) => (true, "Connection to MK-Auth established".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    async fn fetch_overdue_debtors(
        &self,
        config: &IntegrationConfig,
        today: NaiveDate,
    ) -> Result<FetchOutcome, AppError> {
        let token = Self::token(config)?;
        let cutoff = overdue_cutoff(today, config.min_days_overdue);
        tracing::info!("Fetching MK-Auth titles due before {}", cutoff);

        let request = self.get(config, token, "/api/v1/titulos").query(&[
            ("status", "aberto".to_string()),
            ("vencimento_ate", cutoff.format("%Y-%m-%d").to_string()),
        ]);
        let body = send_json(request, SourceType::MkAuth, "titles query").await?;
        let fetched =
            FetchedTitles::from_page(array_field(&body, "data"), &MKAUTH_TITLE_FIELDS, cutoff);

        resolve_debtors(
            SourceType::MkAuth,
            fetched,
            |_| None,
            |customer_id| self.lookup_customer(config, token, customer_id),
        )
        .await
    }
}
