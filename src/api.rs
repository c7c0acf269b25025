//! REST endpoints for ingestion, lifecycle sweeps and account administration.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounts::Account;
use crate::error::{DatabaseError, IngestError};
use crate::lifecycle::LifecycleEngine;
use crate::pipeline::{IngestOutcome, IngestionPipeline, RawEmailEvent};
use crate::store::Database;

type ApiResponse = (StatusCode, Json<Value>);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub pipeline: Arc<IngestionPipeline>,
    pub engine: Arc<LifecycleEngine>,
}

/// Build the Axum router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/interactions/ingest", post(ingest))
        .route("/api/interactions/precheck", post(precheck))
        .route("/api/interactions/{id}/messages", get(interaction_messages))
        .route("/api/lifecycle/sweep", post(run_sweep))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/{id}", get(get_account))
        .route("/api/accounts/{id}/archive", post(archive_account))
        .route("/api/accounts/{id}/interactions", get(account_interactions))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "crm-intake"
    }))
}

// ── Error mapping ───────────────────────────────────────────────────────

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

fn storage_error(e: DatabaseError) -> ApiResponse {
    match e {
        DatabaseError::Constraint(msg) => error_body(StatusCode::CONFLICT, msg),
        DatabaseError::NotFound { entity, id } => {
            error_body(StatusCode::NOT_FOUND, format!("{entity} {id} not found"))
        }
        other => {
            error!(error = %other, "Storage failure");
            error_body(StatusCode::SERVICE_UNAVAILABLE, other.to_string())
        }
    }
}

fn ingest_error(e: IngestError) -> ApiResponse {
    match e {
        IngestError::Storage(db) => storage_error(db),
        IngestError::ConcurrencyConflict { .. } => {
            warn!(error = %e, "Ingest conflict");
            error_body(StatusCode::CONFLICT, e.to_string())
        }
        IngestError::Validation(_) | IngestError::Classification(_) => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

fn parse_id(id: &str, what: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

// ── Ingestion ───────────────────────────────────────────────────────────

async fn ingest(State(state): State<AppState>, Json(raw): Json<RawEmailEvent>) -> ApiResponse {
    match state.pipeline.ingest(raw).await {
        Ok(result) => {
            let status = match result.outcome {
                IngestOutcome::Created => StatusCode::CREATED,
                IngestOutcome::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::OK,
            };
            (status, Json(json!(result)))
        }
        Err(e) => ingest_error(e),
    }
}

async fn precheck(State(state): State<AppState>, Json(raw): Json<RawEmailEvent>) -> ApiResponse {
    match state.pipeline.precheck(raw).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => ingest_error(e),
    }
}

async fn interaction_messages(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let interaction_id = match parse_id(&id, "interaction") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.db.get_interaction(interaction_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Interaction not found"),
        Err(e) => return storage_error(e),
    }
    match state.db.list_receipts(interaction_id).await {
        Ok(receipts) => (StatusCode::OK, Json(json!(receipts))),
        Err(e) => storage_error(e),
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────────

async fn run_sweep(State(state): State<AppState>) -> ApiResponse {
    match state.engine.sweep(Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(json!(report.summary()))),
        Err(e) => storage_error(e),
    }
}

// ── Accounts ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateAccountRequest {
    name: String,
    #[serde(default)]
    emails: Vec<String>,
}

async fn list_accounts(State(state): State<AppState>) -> ApiResponse {
    match state.db.list_accounts().await {
        Ok(accounts) => (StatusCode::OK, Json(json!(accounts))),
        Err(e) => storage_error(e),
    }
}

async fn create_account(
    State(state): State<AppState>,
    Json(body): Json<CreateAccountRequest>,
) -> ApiResponse {
    let name = body.name.trim();
    if name.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Account name is required");
    }
    let account = Account::new(name, &body.emails);
    if account.emails.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "At least one email is required");
    }

    match state.db.create_account(&account).await {
        Ok(()) => {
            info!(account_id = %account.id, name = %account.name, "Account created via API");
            (StatusCode::CREATED, Json(json!(account)))
        }
        Err(e) => storage_error(e),
    }
}

async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let account_id = match parse_id(&id, "account") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.db.get_account(account_id).await {
        Ok(Some(account)) => (StatusCode::OK, Json(json!(account))),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Account not found"),
        Err(e) => storage_error(e),
    }
}

async fn archive_account(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let account_id = match parse_id(&id, "account") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.db.archive_account(account_id).await {
        Ok(Some(account)) => (StatusCode::OK, Json(json!(account))),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Account not found"),
        Err(e) => storage_error(e),
    }
}

async fn account_interactions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let account_id = match parse_id(&id, "account") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.db.get_account(account_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Account not found"),
        Err(e) => return storage_error(e),
    }
    match state.db.list_interactions(account_id).await {
        Ok(interactions) => (StatusCode::OK, Json(json!(interactions))),
        Err(e) => storage_error(e),
    }
}
