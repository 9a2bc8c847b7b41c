//! End-to-end scenarios over the in-memory stores
//!
//! Each test drives the real engines (hotpath, coldpath, pipeline) the way
//! the service does, asserting snapshot state, event metadata, UPI history,
//! and outbound stream contents.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use position_core::coldpath::ColdpathEngine;
use position_core::config::EngineSettings;
use position_core::contract_rules::{ContractRulesCache, StaticContractRulesClient};
use position_core::core_types::{Direction, PositionKey};
use position_core::emitter::{OutboundEmitter, OutboundReceivers};
use position_core::events::MetaLots;
use position_core::hotpath::HotpathEngine;
use position_core::models::{PositionStatus, ReconciliationStatus, TaxLotMethod, TradeEvent, TradeType};
use position_core::position_key;
use position_core::store::memory::{MemoryPositionStore, MemoryUpiHistoryStore};
use position_core::store::{PositionStore, UpiHistoryStore};
use position_core::upi::UpiChangeType;

// ============================================================
// HARNESS
// ============================================================

struct Harness {
    store: Arc<MemoryPositionStore>,
    history: Arc<MemoryUpiHistoryStore>,
    hotpath: HotpathEngine,
    coldpath: ColdpathEngine,
    rx: OutboundReceivers,
}

fn harness(method: TaxLotMethod) -> Harness {
    let store = Arc::new(MemoryPositionStore::new());
    let history = Arc::new(MemoryUpiHistoryStore::new());
    let (emitter, rx) = OutboundEmitter::new();
    let emitter = Arc::new(emitter);
    let rules = Arc::new(ContractRulesCache::new(
        Arc::new(StaticContractRulesClient::new(method)),
        Duration::from_secs(300),
        Duration::from_millis(40),
        TaxLotMethod::Fifo,
    ));
    let settings = EngineSettings::default();

    let hotpath = HotpathEngine::new(
        store.clone() as Arc<dyn PositionStore>,
        history.clone() as Arc<dyn UpiHistoryStore>,
        rules.clone(),
        emitter.clone(),
        settings.clone(),
    );
    let coldpath = ColdpathEngine::new(
        store.clone() as Arc<dyn PositionStore>,
        history.clone() as Arc<dyn UpiHistoryStore>,
        rules,
        emitter,
        settings,
    );

    Harness {
        store,
        history,
        hotpath,
        coldpath,
        rx,
    }
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn long_key() -> PositionKey {
    position_key::generate("ACC-1", "AAPL", "USD", Direction::Long)
}

fn short_key() -> PositionKey {
    position_key::generate("ACC-1", "AAPL", "USD", Direction::Short)
}

fn trade(id: &str, trade_type: TradeType, qty: Decimal, price: Decimal, eff: &str) -> TradeEvent {
    TradeEvent {
        trade_id: id.to_string(),
        position_key: None,
        account: "ACC-1".into(),
        instrument: "AAPL".into(),
        currency: "USD".into(),
        trade_type,
        quantity: qty,
        price,
        effective_date: date(eff),
        contract_id: "C-1".into(),
        correlation_id: format!("corr-{id}"),
        causation_id: format!("cause-{id}"),
        user_id: "u1".into(),
        sequence_status: None,
    }
}

// ============================================================
// S1: NEW_TRADE, INCREASE, PARTIAL DECREASE
// ============================================================

#[tokio::test]
async fn s1_open_increase_partial_decrease() {
    let h = harness(TaxLotMethod::Fifo);

    h.hotpath
        .process(trade("T1", TradeType::NewTrade, dec!(1000), dec!(50), "2025-01-10"))
        .await
        .unwrap();
    h.hotpath
        .process(trade("T2", TradeType::Increase, dec!(500), dec!(55), "2025-01-11"))
        .await
        .unwrap();
    let outcome = h
        .hotpath
        .process(trade("T3", TradeType::Decrease, dec!(200), dec!(60), "2025-01-12"))
        .await
        .unwrap();

    assert_eq!(outcome.new_total_qty, dec!(1300));
    assert_eq!(outcome.event_version, 3);

    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(snap.last_ver, 3);
    assert_eq!(snap.status, PositionStatus::Active);
    assert_eq!(snap.upi, "T1");
    assert_eq!(snap.compressed_lots.qtys, vec![dec!(800), dec!(500)]);
    assert_eq!(snap.compressed_lots.prices, vec![dec!(50), dec!(55)]);

    // realized P&L on T3 = (60-50)*200
    let events = h.store.events(&long_key()).await.unwrap();
    let decrease = events.iter().find(|e| e.event_ver == 3).unwrap();
    match decrease.meta_lots.as_ref().unwrap() {
        MetaLots::Reduced(result) => {
            assert_eq!(result.realized_pnl, dec!(2000));
            assert_eq!(result.closed_qty, dec!(200));
            assert_eq!(result.excess_qty, dec!(0));
        }
        other => panic!("expected Reduced meta, got {other:?}"),
    }
}

// ============================================================
// S2: FULL CLOSE THEN REOPEN
// ============================================================

#[tokio::test]
async fn s2_full_close_then_reopen() {
    let h = harness(TaxLotMethod::Fifo);

    h.hotpath
        .process(trade("T1", TradeType::NewTrade, dec!(1000), dec!(50), "2025-01-10"))
        .await
        .unwrap();
    let close = h
        .hotpath
        .process(trade("T2", TradeType::Decrease, dec!(1000), dec!(60), "2025-01-11"))
        .await
        .unwrap();

    assert_eq!(close.new_total_qty, dec!(0));
    assert_eq!(close.status, PositionStatus::Terminated);
    assert_eq!(close.upi, "T1"); // retained for audit

    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert!(snap.compressed_lots.is_empty());

    let events = h.store.events(&long_key()).await.unwrap();
    match events[1].meta_lots.as_ref().unwrap() {
        MetaLots::Reduced(result) => assert_eq!(result.realized_pnl, dec!(10000)),
        other => panic!("expected Reduced meta, got {other:?}"),
    }

    let reopen = h
        .hotpath
        .process(trade("T3", TradeType::NewTrade, dec!(200), dec!(70), "2025-01-12"))
        .await
        .unwrap();
    assert_eq!(reopen.status, PositionStatus::Active);
    assert_eq!(reopen.upi, "T3");
    assert_eq!(reopen.event_version, 3);

    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(snap.compressed_lots.qtys, vec![dec!(200)]);
    assert_eq!(snap.compressed_lots.prices, vec![dec!(70)]);

    let changes: Vec<UpiChangeType> = h
        .history
        .history(&long_key())
        .await
        .unwrap()
        .iter()
        .map(|e| e.change_type)
        .collect();
    assert_eq!(
        changes,
        vec![
            UpiChangeType::Created,
            UpiChangeType::Terminated,
            UpiChangeType::Reopened
        ]
    );
}

// ============================================================
// S3: SIGN CHANGE, LONG -> SHORT
// ============================================================

#[tokio::test]
async fn s3_sign_change_long_to_short() {
    let h = harness(TaxLotMethod::Fifo);

    h.hotpath
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), "2025-01-10"))
        .await
        .unwrap();
    let outcome = h
        .hotpath
        .process(trade("T2", TradeType::Decrease, dec!(150), dec!(55), "2025-01-11"))
        .await
        .unwrap();

    // old LONG key: event V=2 closes 100, realized (55-50)*100 = 500
    assert_eq!(outcome.event_version, 2);
    assert_eq!(outcome.status, PositionStatus::Terminated);
    let long_snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(long_snap.status, PositionStatus::Terminated);
    assert!(long_snap.compressed_lots.is_empty());

    let long_events = h.store.events(&long_key()).await.unwrap();
    match long_events[1].meta_lots.as_ref().unwrap() {
        MetaLots::Reduced(result) => {
            assert_eq!(result.realized_pnl, dec!(500));
            assert_eq!(result.excess_qty, dec!(50));
        }
        other => panic!("expected Reduced meta, got {other:?}"),
    }

    // new SHORT key: NEW_TRADE qty 50 @55, new upi = T2
    let split = outcome.split.unwrap();
    assert_eq!(split.position_key, short_key());
    let short_snap = h.store.snapshot(&short_key()).await.unwrap().unwrap();
    assert_eq!(short_snap.status, PositionStatus::Active);
    assert_eq!(short_snap.upi, "T2");
    assert_eq!(short_snap.direction, Direction::Short);
    assert_eq!(short_snap.total_qty(), dec!(-50));
    assert_eq!(short_snap.compressed_lots.prices, vec![dec!(55)]);

    // both events share the trade's logical identity via correlation
    let short_events = h.store.events(&short_key()).await.unwrap();
    assert_eq!(short_events.len(), 1);
    assert_eq!(short_events[0].correlation_id, "corr-T2");
    assert_eq!(short_events[0].causation_id, "T2");

    // history: TERMINATED on the long key, CREATED on the short key
    let long_changes: Vec<UpiChangeType> = h
        .history
        .history(&long_key())
        .await
        .unwrap()
        .iter()
        .map(|e| e.change_type)
        .collect();
    assert!(long_changes.contains(&UpiChangeType::Terminated));
    let short_changes: Vec<UpiChangeType> = h
        .history
        .history(&short_key())
        .await
        .unwrap()
        .iter()
        .map(|e| e.change_type)
        .collect();
    assert_eq!(short_changes, vec![UpiChangeType::Created]);
}

// ============================================================
// S4: HIFO ALLOCATION
// ============================================================

#[tokio::test]
async fn s4_hifo_allocation() {
    let h = harness(TaxLotMethod::Hifo);

    h.hotpath
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), "2025-01-10"))
        .await
        .unwrap();
    h.hotpath
        .process(trade("T2", TradeType::Increase, dec!(100), dec!(60), "2025-01-11"))
        .await
        .unwrap();
    h.hotpath
        .process(trade("T3", TradeType::Increase, dec!(100), dec!(55), "2025-01-12"))
        .await
        .unwrap();
    let outcome = h
        .hotpath
        .process(trade("T4", TradeType::Decrease, dec!(120), dec!(65), "2025-01-13"))
        .await
        .unwrap();

    assert_eq!(outcome.new_total_qty, dec!(180));

    let events = h.store.events(&long_key()).await.unwrap();
    match events[3].meta_lots.as_ref().unwrap() {
        MetaLots::Reduced(result) => {
            // 100 from the @60 lot, then 20 from the @55 lot
            assert_eq!(result.allocations.len(), 2);
            assert_eq!(result.allocations[0].lot_price, dec!(60));
            assert_eq!(result.allocations[0].closed_qty, dec!(100));
            assert_eq!(result.allocations[1].lot_price, dec!(55));
            assert_eq!(result.allocations[1].closed_qty, dec!(20));
            // (65-60)*100 + (65-55)*20 = 700
            assert_eq!(result.realized_pnl, dec!(700));
        }
        other => panic!("expected Reduced meta, got {other:?}"),
    }

    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(snap.compressed_lots.prices, vec![dec!(50), dec!(55)]);
    assert_eq!(snap.compressed_lots.qtys, vec![dec!(100), dec!(80)]);
}

// ============================================================
// S5: BACKDATED CORRECTION WITH UPI INVALIDATION
// ============================================================

#[tokio::test]
async fn s5_backdated_correction_invalidates_reopen() {
    let mut h = harness(TaxLotMethod::Fifo);

    h.hotpath
        .process(trade("T1", TradeType::NewTrade, dec!(1000), dec!(50), "2025-01-10"))
        .await
        .unwrap();
    h.hotpath
        .process(trade("T2", TradeType::Decrease, dec!(1000), dec!(60), "2025-01-20"))
        .await
        .unwrap();
    h.hotpath
        .process(trade("T3", TradeType::NewTrade, dec!(500), dec!(70), "2025-01-25"))
        .await
        .unwrap();

    let pre = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(pre.upi, "T3");

    // the backdated trade arrives
    let outcome = h
        .coldpath
        .process(trade("T0", TradeType::Increase, dec!(300), dec!(45), "2025-01-15"))
        .await
        .unwrap();

    assert_eq!(outcome.upi, "T1");
    assert_eq!(outcome.invalidated_upis, vec!["T3".to_string()]);
    assert_eq!(outcome.restored_upi, Some("T1".to_string()));

    // replayed timeline: the decrease hits 1300, closes 1000, leaves 300;
    // T3 is an increase on the still-live T1
    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(snap.upi, "T1");
    assert_eq!(snap.status, PositionStatus::Active);
    assert_eq!(snap.total_qty(), dec!(800));
    assert_eq!(snap.reconciliation_status, ReconciliationStatus::Reconciled);
    assert_eq!(snap.last_ver, 4);
    assert_eq!(snap.compressed_lots.qtys, vec![dec!(300), dec!(500)]);
    assert_eq!(snap.compressed_lots.prices, vec![dec!(45), dec!(70)]);

    // T0 is idempotency-recorded with its event version
    let record = h.store.idempotency("T0").await.unwrap().unwrap();
    assert_eq!(record.event_version, Some(4));

    // history carries the INVALIDATED and RESTORED transitions
    let changes: Vec<UpiChangeType> = h
        .history
        .history(&long_key())
        .await
        .unwrap()
        .iter()
        .map(|e| e.change_type)
        .collect();
    assert!(changes.contains(&UpiChangeType::Invalidated));
    assert!(changes.contains(&UpiChangeType::Restored));

    // regulatory stream: TRADE_REPORT for T0, then the UPI_INVALIDATION
    // summary BEFORE its TRADE_CORRECTION fan-out
    let mut regulatory = Vec::new();
    while let Ok(record) = h.rx.regulatory.try_recv() {
        regulatory.push(record.payload);
    }
    let types: Vec<&str> = regulatory
        .iter()
        .map(|p| p["type"].as_str().unwrap())
        .collect();
    // three hotpath TRADE_REPORTs, then the coldpath records
    assert_eq!(
        types,
        vec![
            "TRADE_REPORT",
            "TRADE_REPORT",
            "TRADE_REPORT",
            "TRADE_REPORT",
            "UPI_INVALIDATION",
            "TRADE_CORRECTION"
        ]
    );

    let backdated_report = &regulatory[3];
    assert_eq!(backdated_report["tradeId"], "T0");
    assert_eq!(backdated_report["upi"], "T1");

    let invalidation = &regulatory[4];
    assert_eq!(invalidation["invalidatedUPI"], "T3");
    assert_eq!(invalidation["newUPI"], "T1");
    assert_eq!(invalidation["invalidatedTradeIds"][0], "T3");
    assert_eq!(invalidation["actionRequired"], "RESUBMIT_TRADES_WITH_NEW_UPI");

    let correction = &regulatory[5];
    assert_eq!(correction["tradeId"], "T3");
    assert_eq!(correction["originalUPI"], "T3");
    assert_eq!(correction["correctedUPI"], "T1");
    assert_eq!(correction["actionRequired"], "CORRECT_TRADE_WITH_NEW_UPI");

    // provisional marker was emitted on coldpath entry
    let provisional = h.rx.provisional_trade.try_recv().unwrap();
    assert_eq!(provisional.payload["tradeId"], "T0");

    // corrected-position record
    let corrected = h.rx.position_corrected.try_recv().unwrap();
    assert_eq!(corrected.payload["reason"], "BACKDATED_TRADE_RECALCULATION");
    assert_eq!(corrected.payload["backdatedTradeId"], "T0");
}

// ============================================================
// S6: IDEMPOTENT CONCURRENT RESUBMIT
// ============================================================

#[tokio::test]
async fn s6_concurrent_resubmit_writes_one_event() {
    let h = harness(TaxLotMethod::Fifo);
    let hotpath = Arc::new(h.hotpath);

    let t1 = trade("T1", TradeType::NewTrade, dec!(1000), dec!(50), "2025-01-10");
    let a = {
        let hotpath = hotpath.clone();
        let t = t1.clone();
        tokio::spawn(async move { hotpath.process(t).await })
    };
    let b = {
        let hotpath = hotpath.clone();
        let t = t1.clone();
        tokio::spawn(async move { hotpath.process(t).await })
    };

    let ra = a.await.unwrap().unwrap();
    let rb = b.await.unwrap().unwrap();

    // both calls observe the same committed version
    assert_eq!(ra.event_version, 1);
    assert_eq!(rb.event_version, 1);
    assert!(ra.duplicate || rb.duplicate);

    // exactly one event with this trade id; lastVer advanced by one
    let events = h.store.events(&long_key()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload.trade_id, "T1");
    let snap = h.store.snapshot(&long_key()).await.unwrap().unwrap();
    assert_eq!(snap.last_ver, 1);
}
