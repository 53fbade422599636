// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The edge is deliberately thin: it
// validates input shapes, calls the engine interfaces, and serializes
// results. Failures come back as structured `{type, message, timestamp}`
// bodies — never stack traces. Authentication sits in front of this
// service and is not handled here.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::errors::{ErrorBody, ServiceError};
use crate::publish::payloads::SubscriptionEventType;
use crate::types::{OrderOperation, SubscriptionStatus, TickMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Subscriptions ───────────────────────────────────────────
        .route("/api/v1/subscriptions", get(list_subscriptions))
        .route("/api/v1/subscriptions", post(create_subscription))
        .route("/api/v1/subscriptions/:token", delete(remove_subscription))
        // ── Orders ──────────────────────────────────────────────────
        .route("/api/v1/orders", post(submit_order))
        .route("/api/v1/orders/dead-letter", get(dead_letter_orders))
        .route("/api/v1/orders/:id", get(get_order))
        // ── Admin ───────────────────────────────────────────────────
        .route("/api/v1/admin/reload", post(trigger_reload))
        .route("/api/v1/admin/instruments/refresh", post(refresh_instruments))
        .route("/api/v1/admin/bootstrap/reset", post(reset_bootstrap))
        // ── WebSocket feed ──────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, err: &ServiceError) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody::from(err)))
}

fn not_found(what: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    error_response(
        StatusCode::NOT_FOUND,
        &ServiceError::NotFound(what.into()),
    )
}

fn internal(message: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &ServiceError::Internal(message.to_string()),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<SubscriptionStatus>().map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, &ServiceError::Validation(e))
        })?),
    };

    let rows = state
        .store
        .list(status, query.limit.min(1000), query.offset)
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct CreateSubscription {
    instrument_token: u32,
    #[serde(default = "default_mode")]
    mode: TickMode,
}

fn default_mode() -> TickMode {
    TickMode::Quote
}

#[derive(Serialize)]
struct SubscriptionAck {
    instrument_token: u32,
    created: bool,
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSubscription>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let created = state
        .store
        .upsert(body.instrument_token, body.mode, None)
        .map_err(internal)?;

    if created {
        state
            .coordinator
            .announce(
                SubscriptionEventType::SubscriptionCreated,
                body.instrument_token,
                json!({"mode": body.mode}),
            )
            .await;
    }

    // Assignment catches up via the debounced reload.
    state.coordinator.reload();
    info!(token = body.instrument_token, mode = %body.mode, created, "subscription request accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubscriptionAck {
            instrument_token: body.instrument_token,
            created,
        }),
    ))
}

async fn remove_subscription(
    State(state): State<Arc<AppState>>,
    Path(token): Path<u32>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let changed = state.store.deactivate(token).map_err(internal)?;
    if !changed {
        return Err(not_found(format!("active subscription for token {token}")));
    }

    state
        .coordinator
        .announce(SubscriptionEventType::SubscriptionRemoved, token, json!({}))
        .await;
    state.coordinator.reload();

    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct SubmitOrder {
    operation: OrderOperation,
    account_id: String,
    params: serde_json::Value,
}

#[derive(Serialize)]
struct OrderAck {
    task_id: Uuid,
    submitted_at: i64,
}

async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitOrder>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    if !state.sessions.is_healthy(&body.account_id) {
        return Err(error_response(
            StatusCode::CONFLICT,
            &ServiceError::Auth {
                account: body.account_id.clone(),
                reason: "account is unhealthy or unknown".into(),
            },
        ));
    }

    let task_id = state
        .executor
        .submit(body.operation, body.params, &body.account_id)
        .map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAck {
            task_id,
            submitted_at: Utc::now().timestamp_millis(),
        }),
    ))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    match state.executor.get(id).map_err(internal)? {
        Some(task) => Ok(Json(task)),
        None => Err(not_found(format!("order task {id}"))),
    }
}

async fn dead_letter_orders(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let tasks = state.executor.dead_letters(100).map_err(internal)?;
    Ok(Json(tasks))
}

// =============================================================================
// Admin
// =============================================================================

async fn trigger_reload(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.coordinator.reload();
    StatusCode::ACCEPTED
}

async fn refresh_instruments(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let count = state
        .registry
        .refresh(Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(json!({"instruments": count})))
}

#[derive(Deserialize)]
struct ResetBootstrap {
    account_id: String,
}

async fn reset_bootstrap(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetBootstrap>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    if state.bootstrapper().reset(&body.account_id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(not_found(format!(
            "bootstrap state for account {}",
            body.account_id
        )))
    }
}
