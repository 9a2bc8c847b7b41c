//! OpenAPI document

use utoipa::OpenApi;

use super::handlers;
use super::types::{HealthResponse, SubmitTradeResponse};
use crate::events::{EventType, MetaLots, PositionEvent};
use crate::lot_engine::{LotAllocation, LotAllocationResult, LotOpenResult};
use crate::models::{
    PositionStatus, ReconciliationStatus, SequenceStatus, Snapshot, TaxLot, TaxLotMethod,
    TradeEvent, TradeType,
};
use crate::position_state::CompressedLots;
use crate::upi::{UpiChangeType, UpiHistoryEntry};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Position Core API",
        description = "Event-sourced position management engine for equity swaps",
        version = "0.1.0"
    ),
    paths(
        handlers::submit_trade,
        handlers::get_position,
        handlers::get_position_by_upi,
        handlers::get_position_events,
        handlers::get_upi_history,
        handlers::search_positions,
        handlers::health,
    ),
    components(schemas(
        TradeEvent,
        TradeType,
        SequenceStatus,
        TaxLot,
        TaxLotMethod,
        Snapshot,
        CompressedLots,
        PositionStatus,
        ReconciliationStatus,
        PositionEvent,
        EventType,
        MetaLots,
        LotOpenResult,
        LotAllocation,
        LotAllocationResult,
        UpiHistoryEntry,
        UpiChangeType,
        SubmitTradeResponse,
        HealthResponse,
    )),
    tags(
        (name = "Trading", description = "Synchronous trade submission"),
        (name = "Diagnostics", description = "Observable state queries"),
        (name = "Ops", description = "Health and readiness")
    )
)]
pub struct ApiDoc;
