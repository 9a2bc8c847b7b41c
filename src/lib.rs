//! position_core - Event-sourced position management for equity swaps
//!
//! Ingests trade events, decides their temporal class, maintains per-position
//! tax-lot state under optimistic concurrency, and repairs history when late
//! trades arrive.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier types (PositionKey, EventVer, UPI, ...)
//! - [`models`] - Trades, tax lots, snapshots, idempotency records
//! - [`position_key`] - Deterministic SHA-256 position identity
//! - [`lot_engine`] - FIFO/LIFO/HIFO allocation and realized P&L
//! - [`position_state`] - In-memory aggregate + compressed lot storage
//! - [`validator`] - Schema / format / state-machine gate
//! - [`classifier`] - CURRENT / FORWARD_DATED / BACKDATED decision
//! - [`events`] - Append-only versioned event log types
//! - [`store`] - Event/snapshot/idempotency/UPI-history containers
//! - [`contract_rules`] - Read-through cache for the tax-lot method
//! - [`upi`] - Unique Position Identifier lifecycle
//! - [`hotpath`] - Synchronous apply with optimistic retry
//! - [`coldpath`] - Chronological replay for backdated trades
//! - [`emitter`] - After-commit outbound streams
//! - [`pipeline`] - Partitioned hot/cold worker pools
//! - [`gateway`] - HTTP submit + diagnostics

// Core types - must be first!
pub mod core_types;

// Configuration + observability
pub mod config;
pub mod logging;

// Domain
pub mod classifier;
pub mod error;
pub mod events;
pub mod lot_engine;
pub mod messages;
pub mod models;
pub mod position_key;
pub mod position_state;
pub mod upi;
pub mod validator;

// Infrastructure
pub mod contract_rules;
pub mod emitter;
pub mod store;

// Processing paths
pub mod coldpath;
pub mod hotpath;
pub mod pipeline;

// Transport
pub mod gateway;

// Convenient re-exports at crate root
pub use classifier::Classifier;
pub use coldpath::ColdpathEngine;
pub use config::AppConfig;
pub use core_types::{Direction, EventVer, PositionKey, TradeId, Upi};
pub use emitter::{OutboundEmitter, OutboundReceivers, StreamName};
pub use error::EngineError;
pub use events::{EventType, PositionEvent};
pub use hotpath::{ApplyOutcome, HotpathEngine};
pub use lot_engine::{LotAllocationResult, LotEngine};
pub use models::{
    PositionStatus, ReconciliationStatus, SequenceStatus, Snapshot, TaxLot, TaxLotMethod,
    TradeEvent, TradeType,
};
pub use pipeline::{SubmitOutcome, SubmitStatus, TradePipeline};
pub use position_state::{compress, inflate, CompressedLots, PositionState};
pub use validator::Validator;
