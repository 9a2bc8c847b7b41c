//! Shared gateway state

use std::sync::Arc;

use crate::pipeline::TradePipeline;
use crate::store::{PositionStore, UpiHistoryStore};

/// Everything the handlers need, behind one `Arc`.
pub struct AppState {
    pub pipeline: Arc<TradePipeline>,
    pub store: Arc<dyn PositionStore>,
    pub upi_history: Arc<dyn UpiHistoryStore>,
    /// Postgres pool when running against a database; `None` in memory
    /// mode. Only the health probe uses it directly.
    pub pg_pool: Option<sqlx::PgPool>,
}
