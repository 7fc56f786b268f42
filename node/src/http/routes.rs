//! Route handlers (spec §6). Each is a few lines: extract inputs, call
//! exactly one core operation, map the result to a response.

use std::{convert::Infallible, sync::Arc, time::Duration};

use agent_core::{
    clock::Clock,
    models::{LedgerCategory, RequestStatus},
    repository::LedgerFilter,
    scheduler,
    AgentError,
};
use axum::{
    extract::{Query, State},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use super::error::ApiError;
use crate::state::AppState;

// --- POST /request --- //

#[derive(Deserialize)]
pub struct RequestBody {
    pub endpoint: String,
    pub request_id: Option<String>,
}

#[instrument(skip(state))]
pub async fn request_endpoint(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequestBody>,
) -> Result<Response, ApiError> {
    let request = state
        .coordinator
        .request_or_advance(&body.endpoint, body.request_id.as_deref())
        .await?;

    let response = match request.status {
        RequestStatus::Fulfilled => (
            axum::http::StatusCode::OK,
            Json(json!({
                "status": "FULFILLED",
                "requestId": request.id,
                "data": request.data_payload,
            })),
        )
            .into_response(),
        RequestStatus::PaymentRequired => {
            let mut resp = (
                axum::http::StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "status": "PAYMENT_REQUIRED",
                    "requestId": request.id,
                    "amount": request.amount.to_string(),
                    "currency": request.currency,
                    "facilitatorUrl": request.facilitator_url,
                })),
            )
                .into_response();
            let headers = resp.headers_mut();
            headers.insert("Payment-Network", "solana-devnet".parse().unwrap());
            headers.insert("Payment-Methods", request.currency.parse().unwrap());
            headers.insert(
                "Payment-Facilitator",
                request.facilitator_url.parse().unwrap_or_else(|_| "".parse().unwrap()),
            );
            resp
        }
        RequestStatus::Paid => (
            axum::http::StatusCode::ACCEPTED,
            Json(json!({ "status": "PAID", "requestId": request.id })),
        )
            .into_response(),
        RequestStatus::Failed => (
            axum::http::StatusCode::CONFLICT,
            Json(json!({ "status": "FAILED", "requestId": request.id })),
        )
            .into_response(),
    };
    Ok(response)
}

// --- POST /payments/execute --- //

#[derive(Deserialize)]
pub struct ExecuteBody {
    pub request_id: String,
    pub session_id: Option<String>,
}

#[instrument(skip(state))]
pub async fn execute_payment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    match state
        .executor
        .clone()
        .execute(&body.request_id, body.session_id.as_deref())
        .await
    {
        Ok(request) => Ok((
            axum::http::StatusCode::OK,
            Json(json!({ "status": request.status, "requestId": request.id, "paymentHash": request.payment_hash })),
        )
            .into_response()),
        Err(AgentError::PaymentsPaused(reason)) => {
            let snapshot = state.repo.latest_balance_snapshot().await.ok().flatten();
            Ok((
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "pauseReason": reason.to_string(),
                    "balance": snapshot.as_ref().map(|s| s.balance.to_string()),
                    "threshold": snapshot.as_ref().map(|s| s.threshold.to_string()),
                })),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

// --- GET /payments/balance --- //

#[instrument(skip(state))]
pub async fn get_balance(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let snapshot = state
        .repo
        .latest_balance_snapshot()
        .await
        .map_err(AgentError::RepositoryTransient)?;
    let system_state = state.balance.current_state().await;

    Ok(Json(json!({
        "balance": snapshot.as_ref().map(|s| s.balance.to_string()),
        "status": snapshot.as_ref().map(|s| s.status),
        "threshold": snapshot.as_ref().map(|s| s.threshold.to_string()),
        "paused": system_state.payments_paused,
        "pauseReason": system_state.pause_reason,
        "lastUpdated": snapshot.as_ref().map(|s| s.sampled_at.as_i64()),
    }))
    .into_response())
}

// --- POST /payments/facilitator/callback --- //

#[derive(Deserialize)]
pub struct FacilitatorCallbackBody {
    pub tx_hash: String,
    pub status: String,
    #[allow(dead_code)]
    pub reason: Option<String>,
}

#[instrument(skip(state, headers, raw_body))]
pub async fn facilitator_callback(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    raw_body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let signature = headers
        .get("X-Facilitator-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !state.facilitator.verify_callback(signature, &raw_body) {
        return Err(AgentError::FacilitatorSignatureInvalid.into());
    }

    let body: FacilitatorCallbackBody =
        serde_json::from_slice(&raw_body).map_err(|e| AgentError::RepositoryTransient(e.into()))?;

    if body.status != "confirmed" {
        return Ok((axum::http::StatusCode::OK, Json(json!({ "acknowledged": true }))).into_response());
    }

    state.coordinator.reconcile_callback(&body.tx_hash).await?;
    Ok((axum::http::StatusCode::OK, Json(json!({ "acknowledged": true }))).into_response())
}

// --- GET /logs/ledger --- //

#[derive(Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub category: Option<LedgerCategory>,
    pub event: Option<String>,
    pub request_id: Option<String>,
    pub payment_id: Option<String>,
    pub tx_hash: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[instrument(skip(state))]
pub async fn query_ledger(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LedgerQuery>,
) -> Result<Response, ApiError> {
    let filter = LedgerFilter {
        category: q.category,
        event: q.event,
        request_id: q.request_id,
        payment_id: q.payment_id,
        tx_hash: q.tx_hash,
        from: q.from.map(agent_core::clock::TimestampMs::from_i64),
        to: q.to.map(agent_core::clock::TimestampMs::from_i64),
    };
    let page = state
        .ledger
        .query(&filter, q.limit.unwrap_or(50), q.cursor.as_deref())
        .await
        .map_err(AgentError::RepositoryTransient)?;

    Ok(Json(json!({
        "entries": page.entries,
        "nextCursor": page.next_cursor,
    }))
    .into_response())
}

// --- GET /logs/ledger/export --- //

#[instrument(skip(state))]
pub async fn export_ledger(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LedgerQuery>,
) -> Result<Response, ApiError> {
    let filter = LedgerFilter {
        category: q.category,
        event: q.event,
        request_id: q.request_id,
        payment_id: q.payment_id,
        tx_hash: q.tx_hash,
        from: q.from.map(agent_core::clock::TimestampMs::from_i64),
        to: q.to.map(agent_core::clock::TimestampMs::from_i64),
    };
    let entries = state
        .ledger
        .export(&filter, q.limit.unwrap_or(5000))
        .await
        .map_err(AgentError::RepositoryTransient)?;

    let mut writer = csv::Writer::from_writer(vec![]);
    for entry in entries {
        writer
            .write_record([
                entry.id.as_str(),
                &entry.timestamp.as_i64().to_string(),
                &format!("{:?}", entry.category),
                entry.event.as_str(),
                entry.request_id.as_deref().unwrap_or(""),
                entry.payment_id.as_deref().unwrap_or(""),
                entry.tx_hash.as_deref().unwrap_or(""),
            ])
            .map_err(|e| AgentError::RepositoryTransient(e.into()))?;
    }
    let csv_bytes = writer
        .into_inner()
        .map_err(|e| AgentError::RepositoryTransient(e.into()))?;

    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/csv")],
        csv_bytes,
    )
        .into_response())
}

// --- GET /autonomy/queue --- //

#[derive(Serialize)]
struct TaskWithScore {
    #[serde(flatten)]
    task: agent_core::models::AutonomyTask,
    computed_score: f64,
}

#[instrument(skip(state))]
pub async fn autonomy_queue(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let tasks = state
        .repo
        .list_tasks()
        .await
        .map_err(AgentError::RepositoryTransient)?;
    let now = state.clock.now();

    let out: Vec<TaskWithScore> = tasks
        .into_iter()
        .map(|task| {
            let elapsed = task.last_success_at.map(|t| t.secs_until(now));
            let computed_score = scheduler::score(&task, elapsed);
            TaskWithScore { task, computed_score }
        })
        .collect();

    Ok(Json(out).into_response())
}

// --- GET /sessions/:id --- //

#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .repo
        .get_session(&id)
        .await
        .map_err(AgentError::RepositoryTransient)?
        .ok_or(AgentError::SessionInvalid)?;
    Ok(Json(session).into_response())
}

// --- GET /events/stream --- //

#[instrument(skip(state))]
pub async fn events_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut sub = state.bus.subscribe();
    let stream = async_stream::stream! {
        while let Some(event) = sub.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(SseEvent::default().data(json));
            }
        }
    };
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)))
}
