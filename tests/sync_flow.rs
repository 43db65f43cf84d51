/// End-to-end sync tests: mocked IXC API, in-memory store, frozen clock
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rust_isp_sync::clock::{Clock, FixedClock};
use rust_isp_sync::connectors::{build_http_client, ConnectorRegistry};
use rust_isp_sync::errors::AppError;
use rust_isp_sync::models::{
    ClientRecord, IntegrationConfig, NewIntegration, SourceType, SyncStatus,
};
use rust_isp_sync::reconciler::ReconcilePolicy;
use rust_isp_sync::scheduler::Scheduler;
use rust_isp_sync::store::{MemoryStore, SyncStore};
use rust_isp_sync::sync_service::SyncService;

fn clock() -> FixedClock {
    FixedClock::at(
        NaiveDate::from_ymd_opt(2024, 6, 30)
            .unwrap()
            .and_hms_opt(5, 1, 0)
            .unwrap(),
    )
}

fn service(store: Arc<MemoryStore>) -> SyncService {
    let store: Arc<dyn SyncStore> = store;
    SyncService::new(
        store,
        ConnectorRegistry::with_defaults(build_http_client(Duration::from_secs(5), false).unwrap()),
        ReconcilePolicy {
            empty_confirmations: 2,
        },
        chrono::Duration::minutes(30),
        Arc::new(clock()),
    )
}

fn ixc_integration(server: &MockServer) -> IntegrationConfig {
    NewIntegration {
        integration_type: SourceType::Ixc,
        display_name: None,
        api_url: format!("{}/webservice/v1", server.uri()),
        credentials: HashMap::from([("token".to_string(), "5:secret".to_string())]),
        min_days_overdue: Some(60),
        auto_sync_enabled: true,
        auto_sync_time: Some("05:00".to_string()),
    }
    .into_config(Uuid::new_v4(), clock().now())
    .unwrap()
}

async fn seed_ixc_integration(store: &MemoryStore, server: &MockServer) -> IntegrationConfig {
    let config = ixc_integration(server);
    store.seed_integration(config.clone()).await;
    config
}

fn title(id: u32, customer: u32, due: &str, amount: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id.to_string(),
        "id_cliente": customer.to_string(),
        "data_vencimento": due,
        "valor_aberto": amount,
        "status": status,
        "liberado": "S"
    })
}

async fn mount_titles(server: &MockServer, titles: Vec<serde_json::Value>) {
    Mock::given(method("POST"))
        .and(path("/webservice/v1/fn_areceber"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total": titles.len().to_string(),
            "registros": titles
        })))
        .mount(server)
        .await;
}

async fn mount_customer(server: &MockServer, id: &str, name: &str, cpf: &str) {
    Mock::given(method("POST"))
        .and(path("/webservice/v1/cliente"))
        .and(body_partial_json(serde_json::json!({"query": id})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total": "1",
            "registros": [{"id": id, "razao": name, "cnpj_cpf": cpf, "email": "cliente@isp.com"}]
        })))
        .mount(server)
        .await;
}

/// Debtors 111 (50 + 80) and 222 (10); customer 3 only has a paid title
async fn mount_standard_upstream(server: &MockServer) {
    mount_titles(
        server,
        vec![
            title(1, 1, "2024-01-10", "50.00", "A"),
            title(2, 1, "2024-02-10", "80.00", "A"),
            title(3, 2, "2024-03-10", "10.00", "A"),
            title(4, 3, "2024-03-10", "70.00", "R"),
        ],
    )
    .await;
    mount_customer(server, "1", "Maria Souza", "111.111.111-11").await;
    mount_customer(server, "2", "João Lima", "222.222.222-22").await;

    Mock::given(method("POST"))
        .and(path("/webservice/v1/cliente"))
        .and(body_partial_json(serde_json::json!({"query": "3"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(server)
        .await;
}

fn imported_client(provider_id: Uuid, cpf: &str, at: DateTime<Utc>) -> ClientRecord {
    ClientRecord {
        id: Uuid::new_v4(),
        provider_id,
        name: "ANTIGO".to_string(),
        cpf: cpf.to_string(),
        email: None,
        phone: None,
        address: None,
        bairro: None,
        debt_amount: BigDecimal::from(300),
        reason: "Importado do IXC - 1 título(s) vencido(s)".to_string(),
        inclusion_date: at.date_naive(),
        observations: Some("Importado do IXC em 01/05/2024 05:00".to_string()),
        risk_level: 3,
        is_active: true,
        boletos: Json(vec![]),
        created_at: at,
        updated_at: at,
        deleted_at: None,
    }
}

#[tokio::test]
async fn test_end_to_end_import() {
    let server = MockServer::start().await;
    mount_standard_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    let service = service(store.clone());

    let result = service.run_sync(&integration).await.unwrap();
    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.clients_created, 2);
    assert_eq!(result.clients_updated, 0);
    assert_eq!(result.clients_failed, 0);
    assert_eq!(result.clients_synced, 2);

    let clients = store.clients().await;
    let maria = clients.iter().find(|c| c.cpf == "11111111111").unwrap();
    assert_eq!(maria.debt_amount, BigDecimal::from(130));
    assert_eq!(maria.debt_amount.to_string(), "130.00");
    assert_eq!(maria.risk_level, 2);
    assert_eq!(maria.name, "MARIA SOUZA");
    assert_eq!(maria.boletos.0.len(), 2);
    assert!(clients.iter().all(|c| c.cpf != "33333333333"));

    let stored = store.integration(integration.id).await.unwrap();
    assert_eq!(stored.last_sync_status, SyncStatus::Success);
    assert_eq!(stored.sync_count, 1);
    assert_eq!(stored.error_count, 0);
    assert!(stored.sync_started_at.is_none());
    assert_eq!(stored.last_sync, Some(clock().now()));
}

#[tokio::test]
async fn test_second_identical_sync_is_idempotent() {
    let server = MockServer::start().await;
    mount_standard_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    let service = service(store.clone());

    service.run_sync(&integration).await.unwrap();
    let before = store.clients().await;

    let reloaded = store.integration(integration.id).await.unwrap();
    let result = service.run_sync(&reloaded).await.unwrap();
    assert_eq!(result.clients_created, 0);
    assert_eq!(result.clients_updated, 2);
    assert_eq!(result.clients_removed, 0);

    let after = store.clients().await;
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.debt_amount, a.debt_amount);
        assert_eq!(b.reason, a.reason);
        assert_eq!(b.risk_level, a.risk_level);
        assert_eq!(b.boletos.0, a.boletos.0);
        assert!(a.is_active);
    }
}

#[tokio::test]
async fn test_stale_import_is_soft_deleted() {
    let server = MockServer::start().await;
    mount_standard_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    let earlier = clock().now() - chrono::Duration::days(30);
    store
        .seed_client(imported_client(integration.provider_id, "999.999.999-99", earlier))
        .await;
    // Same cpf as an upstream debtor, stored with punctuation: must be updated, not duplicated
    store
        .seed_client(imported_client(integration.provider_id, "111.111.111-11", earlier))
        .await;

    let result = service(store.clone()).run_sync(&integration).await.unwrap();
    assert_eq!(result.clients_created, 1);
    assert_eq!(result.clients_updated, 1);
    assert_eq!(result.clients_removed, 1);

    let clients = store.clients().await;
    let gone = clients.iter().find(|c| c.cpf == "999.999.999-99").unwrap();
    assert!(!gone.is_active);
    assert_eq!(gone.deleted_at, Some(clock().now()));
    assert_eq!(clients.iter().filter(|c| c.is_active).count(), 2);
}

#[tokio::test]
async fn test_running_sync_rejects_second_run() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let mut integration = ixc_integration(&server);
    integration.last_sync_status = SyncStatus::InProgress;
    integration.sync_started_at = Some(clock().now() - chrono::Duration::minutes(5));
    store.seed_integration(integration.clone()).await;

    let err = service(store.clone()).run_sync(&integration).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn test_stale_in_progress_marker_is_taken_over() {
    let server = MockServer::start().await;
    mount_titles(&server, vec![]).await;

    let store = Arc::new(MemoryStore::new());
    let mut integration = ixc_integration(&server);
    integration.last_sync_status = SyncStatus::InProgress;
    integration.sync_started_at = Some(clock().now() - chrono::Duration::hours(2));
    store.seed_integration(integration.clone()).await;

    let result = service(store.clone()).run_sync(&integration).await.unwrap();
    assert_eq!(result.status, SyncStatus::Success);
}

#[tokio::test]
async fn test_upstream_failure_records_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webservice/v1/fn_areceber"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;

    let result = service(store.clone()).run_sync(&integration).await.unwrap();
    assert_eq!(result.status, SyncStatus::Error);
    assert_eq!(result.clients_synced, 0);

    let stored = store.integration(integration.id).await.unwrap();
    assert_eq!(stored.last_sync_status, SyncStatus::Error);
    assert_eq!(stored.error_count, 1);
    assert_eq!(stored.sync_count, 1);
    assert!(stored.sync_started_at.is_none());
    assert!(stored.last_sync_message.unwrap().contains("500"));
}

#[tokio::test]
async fn test_every_lookup_failing_is_error_and_keeps_imports() {
    let server = MockServer::start().await;
    mount_titles(&server, vec![title(1, 1, "2024-01-10", "50.00", "A")]).await;
    Mock::given(method("POST"))
        .and(path("/webservice/v1/cliente"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    store
        .seed_client(imported_client(integration.provider_id, "55555555555", clock().now()))
        .await;

    let result = service(store.clone()).run_sync(&integration).await.unwrap();
    assert_eq!(result.status, SyncStatus::Error);
    assert_eq!(result.clients_removed, 0);
    assert!(store.clients().await[0].is_active);
}

#[tokio::test]
async fn test_empty_upstream_removes_only_after_confirmation() {
    let server = MockServer::start().await;
    mount_titles(&server, vec![]).await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    store
        .seed_client(imported_client(integration.provider_id, "55555555555", clock().now()))
        .await;
    let service = service(store.clone());

    let first = service.run_sync(&integration).await.unwrap();
    assert_eq!(first.status, SyncStatus::Success);
    assert_eq!(first.clients_removed, 0);
    assert!(first.message.contains("reconciliation skipped"));
    assert!(store.clients().await[0].is_active);

    let reloaded = store.integration(integration.id).await.unwrap();
    assert_eq!(reloaded.consecutive_empty_syncs, 1);

    let second = service.run_sync(&reloaded).await.unwrap();
    assert_eq!(second.clients_removed, 1);
    assert!(!store.clients().await[0].is_active);
}

#[tokio::test]
async fn test_titles_dropped_locally_never_confirm_empty_upstream() {
    let server = MockServer::start().await;
    // Open titles the parser cannot date
    mount_titles(
        &server,
        vec![
            title(1, 1, "sem vencimento", "50.00", "A"),
            title(2, 2, "sem vencimento", "80.00", "A"),
        ],
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    store
        .seed_client(imported_client(integration.provider_id, "55555555555", clock().now()))
        .await;
    let service = service(store.clone());

    let mut current = integration;
    for _ in 0..3 {
        let result = service.run_sync(&current).await.unwrap();
        assert_eq!(result.status, SyncStatus::Partial);
        assert_eq!(result.clients_removed, 0);
        assert!(result.message.contains("none qualified"));

        current = store.integration(current.id).await.unwrap();
        assert_eq!(current.consecutive_empty_syncs, 0);
    }
    assert!(store.clients().await[0].is_active);
}

#[tokio::test]
async fn test_truncated_title_listing_keeps_imports() {
    let server = MockServer::start().await;
    let page: Vec<serde_json::Value> = (1..=1000)
        .map(|id| title(id, 1, "2024-01-10", "10.00", "A"))
        .collect();
    Mock::given(method("POST"))
        .and(path("/webservice/v1/fn_areceber"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total": "60000",
            "registros": page
        })))
        .mount(&server)
        .await;
    mount_customer(&server, "1", "Maria Souza", "111.111.111-11").await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    store
        .seed_client(imported_client(integration.provider_id, "55555555555", clock().now()))
        .await;

    let result = service(store.clone()).run_sync(&integration).await.unwrap();
    assert_eq!(result.status, SyncStatus::Partial);
    assert_eq!(result.clients_created, 1);
    assert_eq!(result.clients_removed, 0);
    assert!(result.message.contains("truncated"));

    let kept = store
        .clients()
        .await
        .into_iter()
        .find(|c| c.cpf == "55555555555")
        .unwrap();
    assert!(kept.is_active);
}

#[tokio::test]
async fn test_inactive_integration_is_rejected() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let mut integration = seed_ixc_integration(&store, &server).await;
    integration.is_active = false;

    let err = service(store).run_sync(&integration).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_scheduler_runs_due_integration() {
    let server = MockServer::start().await;
    mount_standard_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let integration = seed_ixc_integration(&store, &server).await;
    let scheduler = Scheduler::new(Arc::new(service(store.clone())), Duration::from_secs(60), 2);

    let handles = scheduler.tick_once().await.unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }

    let stored = store.integration(integration.id).await.unwrap();
    assert_eq!(stored.sync_count, 1);
    assert_eq!(store.clients().await.len(), 2);

    // Same window, already synced
    let handles = scheduler.tick_once().await.unwrap();
    assert!(handles.is_empty());
}
