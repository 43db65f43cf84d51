use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::{
    array_field, overdue_cutoff, resolve_debtors, send_json, send_lookup, Connector,
    FetchedTitles, TitleFields,
};
use crate::errors::AppError;
use crate::models::{FetchOutcome, IntegrationConfig, SourceType};
use crate::normalizer::value_text;

static RADIUSNET_TITLE_FIELDS: TitleFields = TitleFields {
    id: &["id", "titulo_id"],
    customer_id: &["cliente_id", "id_cliente"],
    due_date: &["vencimento", "data_vencimento"],
    amount: &["valor_aberto", "valor"],
    linha_digitavel: &["linha_digitavel"],
    nosso_numero: &["nosso_numero"],
    codigo_barras: &["codigo_barras"],
    payment_link: &["link_boleto", "url_boleto"],
    required: &[("status", "aberto")],
};

/// RadiusNet API: username/password login yields a session bearer token.
pub struct RadiusNetConnector {
    client: Client,
}

impl RadiusNetConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn login(&self, config: &IntegrationConfig) -> Result<String, AppError> {
        let (username, password) =
            match (config.credential("username"), config.credential("password")) {
                (Some(u), Some(p)) => (u, p),
                _ => {
                    return Err(AppError::Configuration(
                        "RadiusNet integration requires username and password".to_string(),
                    ))
                }
            };

        let request = self
            .client
            .post(format!("{}/api/login", config.base_url()))
            .json(&json!({ "username": username, "password": password }));
        let body = send_json(request, SourceType::Radiusnet, "login").await?;

        body.get("token").and_then(value_text).ok_or_else(|| {
            AppError::Configuration("RadiusNet login did not return a token".to_string())
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
        let request = self.get(config, token, &format!("/api/clientes/{}", customer_id));
        send_lookup(request, SourceType::Radiusnet, &customer_id, |body| body.get("cliente"))
            .await
    }
}

#[async_trait]
impl Connector for RadiusNetConnector {
    fn source_type(&self) -> SourceType {
        SourceType::Radiusnet
    }

    async fn test_connection(&self, config: &IntegrationConfig) -> (bool, String) {
        match self.login(config).await {
            Ok(_) => (true, "Connection to RadiusNet established".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    async fn fetch_overdue_debtors(
        &self,
        config: &IntegrationConfig,
        today: NaiveDate,
    ) -> Result<FetchOutcome, AppError> {
        let token = self.login(config).await?;
        let cutoff = overdue_cutoff(today, config.min_days_overdue);
        tracing::info!("Fetching RadiusNet titles due before {}", cutoff);

        let request = self.get(config, &token, "/api/financeiro/titulos").query(&[
            ("status", "aberto".to_string()),
            ("vencimento_ate", cutoff.format("%Y-%m-%d").to_string()),
        ]);
        let body = send_json(request, SourceType::Radiusnet, "titles query").await?;
        let fetched =
            FetchedTitles::from_page(array_field(&body, "titulos"), &RADIUSNET_TITLE_FIELDS, cutoff);

        resolve_debtors(
            SourceType::Radiusnet,
            fetched,
            |_| None,
            |customer_id| self.lookup_customer(config, &token, customer_id),
        )
        .await
    }
}
