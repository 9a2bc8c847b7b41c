//! Gateway handlers - submit endpoint and diagnostic queries

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::core_types::PositionKey;
use crate::events::PositionEvent;
use crate::models::{Snapshot, TradeEvent};
use crate::store::{Page, SnapshotFilter};
use crate::upi::UpiHistoryEntry;

use super::state::AppState;
use super::types::{
    engine_error_response, error_codes, ApiResponse, HealthResponse, SearchParams,
    SubmitTradeResponse,
};

type HandlerError = (StatusCode, Json<ApiResponse<()>>);

fn store_error(e: crate::store::StoreError) -> HandlerError {
    tracing::error!(error = %e, "Store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(error_codes::INTERNAL, e.to_string())),
    )
}

fn not_found(what: impl Into<String>) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(error_codes::NOT_FOUND, what.into())),
    )
}

fn parse_key(raw: &str) -> Result<PositionKey, HandlerError> {
    raw.parse().map_err(|e: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(error_codes::INVALID_PARAMETER, e)),
        )
    })
}

/// Submit a trade synchronously
///
/// POST /api/v1/trades
#[utoipa::path(
    post,
    path = "/api/v1/trades",
    request_body = TradeEvent,
    responses(
        (status = 200, description = "Trade applied, duplicate returned, or queued for reconciliation", body = ApiResponse<SubmitTradeResponse>),
        (status = 422, description = "Validation failed; trade routed to DLQ"),
        (status = 409, description = "Optimistic retry budget exhausted"),
        (status = 503, description = "Transient infrastructure failure")
    ),
    tag = "Trading"
)]
pub async fn submit_trade(
    State(state): State<Arc<AppState>>,
    Json(trade): Json<TradeEvent>,
) -> Result<Json<ApiResponse<SubmitTradeResponse>>, HandlerError> {
    match state.pipeline.submit(trade).await {
        Ok(outcome) => Ok(Json(ApiResponse::ok(outcome.into()))),
        Err(e) => {
            let (status, body) = engine_error_response(&e);
            Err((status, Json(body)))
        }
    }
}

/// Fetch a snapshot by position key
///
/// GET /api/v1/positions/{position_key}
#[utoipa::path(
    get,
    path = "/api/v1/positions/{position_key}",
    params(("position_key" = String, Path, description = "64-char hex position key")),
    responses(
        (status = 200, body = ApiResponse<Snapshot>),
        (status = 404, description = "Unknown position")
    ),
    tag = "Diagnostics"
)]
pub async fn get_position(
    State(state): State<Arc<AppState>>,
    Path(position_key): Path<String>,
) -> Result<Json<ApiResponse<Snapshot>>, HandlerError> {
    let key = parse_key(&position_key)?;
    match state.store.snapshot(&key).await.map_err(store_error)? {
        Some(snapshot) => Ok(Json(ApiResponse::ok(snapshot))),
        None => Err(not_found(format!("position {position_key}"))),
    }
}

/// Fetch a snapshot by UPI
///
/// GET /api/v1/positions/by-upi/{upi}
#[utoipa::path(
    get,
    path = "/api/v1/positions/by-upi/{upi}",
    params(("upi" = String, Path, description = "Unique Position Identifier")),
    responses(
        (status = 200, body = ApiResponse<Snapshot>),
        (status = 404, description = "No position carries this UPI")
    ),
    tag = "Diagnostics"
)]
pub async fn get_position_by_upi(
    State(state): State<Arc<AppState>>,
    Path(upi): Path<String>,
) -> Result<Json<ApiResponse<Snapshot>>, HandlerError> {
    match state.store.snapshot_by_upi(&upi).await.map_err(store_error)? {
        Some(snapshot) => Ok(Json(ApiResponse::ok(snapshot))),
        None => Err(not_found(format!("upi {upi}"))),
    }
}

/// Enumerate a position's events in canonical order
///
/// GET /api/v1/positions/{position_key}/events
#[utoipa::path(
    get,
    path = "/api/v1/positions/{position_key}/events",
    params(("position_key" = String, Path, description = "64-char hex position key")),
    responses((status = 200, body = ApiResponse<Vec<PositionEvent>>)),
    tag = "Diagnostics"
)]
pub async fn get_position_events(
    State(state): State<Arc<AppState>>,
    Path(position_key): Path<String>,
) -> Result<Json<ApiResponse<Vec<PositionEvent>>>, HandlerError> {
    let key = parse_key(&position_key)?;
    let events = state.store.events(&key).await.map_err(store_error)?;
    Ok(Json(ApiResponse::ok(events)))
}

/// UPI lifecycle audit trail for a position
///
/// GET /api/v1/positions/{position_key}/upi-history
#[utoipa::path(
    get,
    path = "/api/v1/positions/{position_key}/upi-history",
    params(("position_key" = String, Path, description = "64-char hex position key")),
    responses((status = 200, body = ApiResponse<Vec<UpiHistoryEntry>>)),
    tag = "Diagnostics"
)]
pub async fn get_upi_history(
    State(state): State<Arc<AppState>>,
    Path(position_key): Path<String>,
) -> Result<Json<ApiResponse<Vec<UpiHistoryEntry>>>, HandlerError> {
    let key = parse_key(&position_key)?;
    let history = state.upi_history.history(&key).await.map_err(store_error)?;
    Ok(Json(ApiResponse::ok(history)))
}

/// Search positions by account / instrument / contract
///
/// GET /api/v1/positions
#[utoipa::path(
    get,
    path = "/api/v1/positions",
    params(SearchParams),
    responses((status = 200, body = ApiResponse<Vec<Snapshot>>)),
    tag = "Diagnostics"
)]
pub async fn search_positions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ApiResponse<Vec<Snapshot>>>, HandlerError> {
    let filter = SnapshotFilter {
        account: params.account,
        instrument: params.instrument,
        contract_id: params.contract_id,
    };
    let page = Page {
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(50).clamp(1, 500),
    };
    let snapshots = state
        .store
        .find_snapshots(&filter, page)
        .await
        .map_err(store_error)?;
    Ok(Json(ApiResponse::ok(snapshots)))
}

/// Liveness/readiness probe
///
/// GET /healthz
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, body = HealthResponse),
        (status = 503, description = "Store unreachable")
    ),
    tag = "Ops"
)]
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, HandlerError> {
    let store = match &state.pg_pool {
        Some(pool) => match crate::store::postgres::health_check(pool).await {
            Ok(()) => "postgres".to_string(),
            Err(e) => {
                return Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ApiResponse::error(error_codes::UNAVAILABLE, e.to_string())),
                ));
            }
        },
        None => "memory".to_string(),
    };
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        store,
    }))
}
