use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;
use crate::policy::SystemPolicy;
use crate::rate_limit::ProviderRateLimiter;
use crate::store::SyncStore;
use crate::sync_service::SyncService;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Client, integration and subscription storage.
    pub store: Arc<dyn SyncStore>,
    /// Sync orchestrator shared with the scheduler.
    pub sync: Arc<SyncService>,
    pub policy: SystemPolicy,
    /// One manual sync or connection test per provider per window.
    pub manual_limiter: ProviderRateLimiter,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-isp-sync",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// GET /api/v1/integration-types
///
/// Supported ERPs and the credential keys each one needs.
pub async fn list_integration_types() -> Json<serde_json::Value> {
    let types: Vec<serde_json::Value> = SourceType::ALL
        .iter()
        .map(|source| {
            json!({
                "type": source,
                "name": source.display_name(),
                "required_credentials": source.required_credentials(),
            })
        })
        .collect();

    Json(json!({ "integration_types": types }))
}

/// GET /api/v1/providers/:provider_id/integrations
pub async fn list_integrations(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<Vec<IntegrationView>>, AppError> {
    let integrations = state.store.list_integrations(provider_id).await?;
    Ok(Json(integrations.iter().map(IntegrationView::from).collect()))
}

/// POST /api/v1/providers/:provider_id/integrations
pub async fn create_integration(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<NewIntegration>,
) -> Result<(StatusCode, Json<IntegrationView>), AppError> {
    tracing::info!(
        "Creating {} integration for provider {}",
        payload.integration_type,
        provider_id
    );

    let config = payload.into_config(provider_id, state.sync.clock().now())?;
    state.store.create_integration(&config).await?;

    Ok((StatusCode::CREATED, Json(IntegrationView::from(&config))))
}

/// DELETE /api/v1/providers/:provider_id/integrations/:id
///
/// Imported clients are left untouched.
pub async fn delete_integration(
    State(state): State<Arc<AppState>>,
    Path((provider_id, id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if !state.store.delete_integration(provider_id, id).await? {
        return Err(AppError::NotFound(format!("Integration {} not found", id)));
    }
    tracing::info!("Deleted integration {} of provider {}", id, provider_id);
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/v1/providers/:provider_id/integrations/:id/auto-sync
pub async fn update_auto_sync(
    State(state): State<Arc<AppState>>,
    Path((provider_id, id)): Path<(Uuid, Uuid)>,
    Json(settings): Json<AutoSyncSettings>,
) -> Result<Json<IntegrationView>, AppError> {
    let existing = load_integration(&state, provider_id, id).await?;

    let sync_time = match settings.sync_time.as_deref() {
        Some(raw) => parse_sync_time(raw).ok_or_else(|| {
            AppError::BadRequest(format!("sync_time must be HH:MM, got '{}'", raw))
        })?,
        None => existing.auto_sync_time,
    };

    state
        .store
        .update_auto_sync(
            provider_id,
            id,
            settings.enabled,
            sync_time,
            state.sync.clock().now(),
        )
        .await?;

    let updated = load_integration(&state, provider_id, id).await?;
    Ok(Json(IntegrationView::from(&updated)))
}

/// POST /api/v1/providers/:provider_id/integrations/:id/test
pub async fn test_integration(
    State(state): State<Arc<AppState>>,
    Path((provider_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let integration = load_integration(&state, provider_id, id).await?;
    state.manual_limiter.check(provider_id).await?;

    let (success, message) = state.sync.test_connection(&integration).await;
    tracing::info!(
        "Connection test for {} integration {}: {}",
        integration.integration_type,
        id,
        if success { "ok" } else { "failed" }
    );

    Ok(Json(json!({
        "success": success,
        "message": message,
    })))
}

/// POST /api/v1/providers/:provider_id/integrations/:id/sync
///
/// Runs a full sync pass synchronously and returns its result.
pub async fn sync_integration(
    State(state): State<Arc<AppState>>,
    Path((provider_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<SyncResult>, AppError> {
    let integration = load_integration(&state, provider_id, id).await?;

    state
        .policy
        .ensure_entitled(state.store.as_ref(), provider_id, state.sync.clock().now())
        .await?;
    state.manual_limiter.check(provider_id).await?;

    tracing::info!(
        "Manual {} sync requested for provider {}",
        integration.integration_type,
        provider_id
    );
    let result = state.sync.run_sync(&integration).await?;
    Ok(Json(result))
}

async fn load_integration(
    state: &AppState,
    provider_id: Uuid,
    id: Uuid,
) -> Result<IntegrationConfig, AppError> {
    state
        .store
        .get_integration(provider_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Integration {} not found", id)))
}
