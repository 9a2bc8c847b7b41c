//! position_core - service entry point
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  Stores   │───▶│   Pipeline   │───▶│ Gateway  │
//! │  (YAML)  │    │ (pg/mem)  │    │  (hot/cold)  │    │  (HTTP)  │
//! └──────────┘    └───────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! With `database.url` configured the four containers live in PostgreSQL;
//! otherwise the in-memory stores back a standalone instance (demos,
//! integration testing).

use std::sync::Arc;
use std::time::Duration;

use position_core::config::AppConfig;
use position_core::contract_rules::{
    ContractRulesCache, ContractRulesClient, HttpContractRulesClient, StaticContractRulesClient,
};
use position_core::emitter::{OutboundEmitter, OutboundReceivers};
use position_core::gateway::{self, state::AppState};
use position_core::store::memory::{MemoryPositionStore, MemoryUpiHistoryStore};
use position_core::store::postgres::{connect, PgPositionStore, PgUpiHistoryStore};
use position_core::store::{schema, PositionStore, UpiHistoryStore};
use position_core::{ColdpathEngine, HotpathEngine, TradePipeline};

fn config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "config.yaml".to_string())
}

/// Consume the outbound streams and log each record. Stands in for the
/// real transport producers, which are wired outside this service.
fn spawn_stream_loggers(receivers: OutboundReceivers) {
    let OutboundReceivers {
        trade_applied,
        provisional_trade,
        position_corrected,
        regulatory,
        dlq,
        error_retry,
    } = receivers;

    macro_rules! drain {
        ($rx:ident) => {
            tokio::spawn(async move {
                let mut rx = $rx;
                while let Some(record) = rx.recv().await {
                    tracing::debug!(
                        stream = record.stream.as_str(),
                        key = %record.key,
                        payload = %record.payload,
                        "Outbound record"
                    );
                }
            });
        };
    }
    drain!(trade_applied);
    drain!(provisional_trade);
    drain!(position_corrected);
    drain!(regulatory);
    drain!(dlq);
    drain!(error_retry);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = if std::path::Path::new(&path).exists() {
        AppConfig::load(&path)?
    } else {
        AppConfig::default()
    };

    let _guard = position_core::logging::init_logging(&config.log);
    tracing::info!(config = %path, "Starting position_core");

    // ----- stores -----
    let (store, upi_history, pg_pool): (
        Arc<dyn PositionStore>,
        Arc<dyn UpiHistoryStore>,
        Option<sqlx::PgPool>,
    ) = if config.database.url.is_empty() {
        tracing::warn!("No database.url configured, using in-memory stores");
        (
            Arc::new(MemoryPositionStore::new()),
            Arc::new(MemoryUpiHistoryStore::new()),
            None,
        )
    } else {
        let pool = connect(&config.database.url, config.database.max_connections).await?;
        schema::init_schema(&pool).await?;
        (
            Arc::new(PgPositionStore::new(pool.clone(), config.engine.partitions)),
            Arc::new(PgUpiHistoryStore::new(pool.clone())),
            Some(pool),
        )
    };

    // ----- contract rules -----
    let client: Arc<dyn ContractRulesClient> = if config.contract_rules.base_url.is_empty() {
        tracing::warn!(
            method = %config.engine.default_tax_lot_method,
            "No contract_rules.base_url configured, using static default method"
        );
        Arc::new(StaticContractRulesClient::new(
            config.engine.default_tax_lot_method,
        ))
    } else {
        Arc::new(HttpContractRulesClient::new(
            config.contract_rules.base_url.clone(),
        ))
    };
    let rules = Arc::new(ContractRulesCache::new(
        client,
        Duration::from_secs(config.contract_rules.ttl_secs),
        Duration::from_millis(config.contract_rules.timeout_ms),
        config.engine.default_tax_lot_method,
    ));

    // ----- emitter + engines + pipeline -----
    let (emitter, receivers) = OutboundEmitter::new();
    let emitter = Arc::new(emitter);
    spawn_stream_loggers(receivers);

    let hotpath = Arc::new(HotpathEngine::new(
        store.clone(),
        upi_history.clone(),
        rules.clone(),
        emitter.clone(),
        config.engine.clone(),
    ));
    let coldpath = Arc::new(ColdpathEngine::new(
        store.clone(),
        upi_history.clone(),
        rules,
        emitter.clone(),
        config.engine.clone(),
    ));
    let pipeline = Arc::new(TradePipeline::spawn(
        hotpath,
        coldpath,
        store.clone(),
        emitter,
        config.engine.clone(),
    ));

    // ----- gateway -----
    let state = Arc::new(AppState {
        pipeline,
        store,
        upi_history,
        pg_pool,
    });
    let app = gateway::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app).await?;

    Ok(())
}
