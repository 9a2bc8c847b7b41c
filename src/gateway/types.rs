//! Gateway request/response types

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::core_types::PositionKey;
use crate::error::EngineError;
use crate::pipeline::SubmitOutcome;

/// Standard API envelope.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: error_codes::OK,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            message: Some(message.into()),
        }
    }
}

pub mod error_codes {
    pub const OK: i32 = 0;
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const VALIDATION_FAILED: i32 = 1002;
    pub const NOT_FOUND: i32 = 1404;
    pub const CONFLICT: i32 = 1409;
    pub const INTERNAL: i32 = 1500;
    pub const UNAVAILABLE: i32 = 1503;

    pub fn for_engine_error(e: &crate::error::EngineError) -> i32 {
        use crate::error::EngineError::*;
        match e {
            Validation(_) => VALIDATION_FAILED,
            RetryExhausted { .. } | DeadlineExceeded { .. } => CONFLICT,
            Transient(_) => UNAVAILABLE,
            Fatal(_) | ReplayInconsistency(_) => INTERNAL,
        }
    }
}

/// Response body of the synchronous submit endpoint.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTradeResponse {
    /// APPLIED | DUPLICATE | QUEUED_BACKDATED
    pub status: String,
    pub position_key: PositionKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_qty: Option<rust_decimal::Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_status: Option<String>,
}

impl From<SubmitOutcome> for SubmitTradeResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            position_key: outcome.position_key,
            event_version: outcome.event_version,
            upi: outcome.upi,
            total_qty: outcome.total_qty,
            position_status: outcome.position_status.map(|s| s.as_str().to_string()),
        }
    }
}

/// Map an engine error to (HTTP status, envelope).
pub fn engine_error_response(e: &EngineError) -> (axum::http::StatusCode, ApiResponse<()>) {
    let status = axum::http::StatusCode::from_u16(e.http_status())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        ApiResponse::error(error_codes::for_engine_error(e), e.to_string()),
    )
}

/// Query parameters for the position search.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub account: Option<String>,
    pub instrument: Option<String>,
    pub contract_id: Option<String>,
    /// 1-based page number (default 1)
    pub page: Option<u32>,
    /// Page size (default 50, max 500)
    pub page_size: Option<u32>,
}

/// Health probe body.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationFailure;

    #[test]
    fn test_envelope_shapes() {
        let ok: ApiResponse<i32> = ApiResponse::ok(7);
        assert_eq!(ok.code, 0);
        assert_eq!(ok.data, Some(7));

        let err: ApiResponse<()> = ApiResponse::error(error_codes::NOT_FOUND, "missing");
        assert_eq!(err.code, 1404);
        assert_eq!(err.message.as_deref(), Some("missing"));
    }

    #[test]
    fn test_engine_error_mapping() {
        let e = EngineError::Validation(ValidationFailure::new(vec![
            "schema: quantity must be positive".into(),
        ]));
        let (status, body) = engine_error_response(&e);
        assert_eq!(status.as_u16(), 422);
        assert_eq!(body.code, error_codes::VALIDATION_FAILED);
    }
}
