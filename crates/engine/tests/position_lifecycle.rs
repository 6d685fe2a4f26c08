mod support;

use chrono::{TimeZone, Utc};
use common::{Error, ExitReason, Side, Signal, TradeEvent};
use strategy::Analysis;
use support::*;
use tokio::sync::broadcast;

#[tokio::test]
async fn entry_ratchet_and_trailing_exit() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    let outcome = trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    assert_eq!(outcome.entry, Some(Side::Long));
    let pos = trader.book().get("BTCUSDT").unwrap().clone();
    assert_eq!(pos.entry_price, 100.0);
    assert_eq!(pos.stop_loss, 96.0);
    assert_eq!(pos.take_profit, 108.0);
    assert_eq!(pos.trailing_offset, 4.0);
    assert_eq!(pos.quantity, 2.0);

    // 110 is through the take profit, which lives on the venue: no engine exit.
    venue.set_price(110.0);
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 110.0, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, None);
    let pos = trader.book().get("BTCUSDT").unwrap();
    assert_eq!(pos.highest_favorable_price, 110.0);
    assert_eq!(pos.trailing_stop, 106.0);

    venue.set_price(105.0);
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 3, 105.0, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, Some(ExitReason::TrailingStop));
    assert!(trader.book().get("BTCUSDT").is_none());

    assert_eq!(venue.orders(), vec!["open BTCUSDT long", "close BTCUSDT"]);
    let trades = store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_price, 105.0);
    assert_eq!(trades[0].pnl, 10.0);

    let saved = store.saved().unwrap();
    assert_eq!(saved.positions["BTCUSDT"], None);
    assert_eq!(saved.last_signal_index["BTCUSDT"], 1);
}

#[tokio::test]
async fn engine_side_take_profit_when_enabled() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut config = make_config();
    config.risk.engine_take_profit = true;
    let mut trader = make_trader_with(&venue, &store, &["BTCUSDT"], config);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    venue.set_price(108.5);
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 108.5, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, Some(ExitReason::TakeProfit));
}

#[tokio::test]
async fn replayed_signal_makes_no_venue_calls() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    let a = view(Signal::EnterLong, 1, 100.0, 2.0);

    trader.step("BTCUSDT", &a).await.unwrap();
    let saves = store.save_count();
    for _ in 0..3 {
        let outcome = trader.step("BTCUSDT", &a).await.unwrap();
        assert_eq!(outcome, Default::default());
    }
    assert_eq!(venue.orders().len(), 1);
    assert_eq!(store.save_count(), saves);
}

#[tokio::test]
async fn consumed_signal_survives_restart() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let a = view(Signal::EnterLong, 1, 100.0, 2.0);

    let mut trader = make_trader(&venue, &store);
    trader.step("BTCUSDT", &a).await.unwrap();
    drop(trader);

    let mut restarted = make_trader(&venue, &store);
    restarted.restore().await.unwrap();
    assert!(restarted.reconcile().await.unwrap().is_empty());
    restarted.step("BTCUSDT", &a).await.unwrap();
    assert_eq!(venue.orders().len(), 1);
    assert_eq!(restarted.book().get("BTCUSDT").unwrap().side, Side::Long);
}

#[tokio::test]
async fn same_direction_signal_is_consumed_without_action() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    let outcome = trader.step("BTCUSDT", &view(Signal::EnterLong, 2, 101.0, 2.0)).await.unwrap();
    assert_eq!(outcome.entry, None);
    assert_eq!(venue.orders().len(), 1);
    assert_eq!(trader.book().last_signal("BTCUSDT"), Some(2));
}

#[tokio::test]
async fn opposite_signal_closes_then_reverses() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    venue.set_price(99.0);
    let outcome = trader.step("BTCUSDT", &view(Signal::EnterShort, 2, 99.0, 2.0)).await.unwrap();

    assert_eq!(outcome.exit, Some(ExitReason::OppositeSignal));
    assert_eq!(outcome.entry, Some(Side::Short));
    assert_eq!(venue.orders(), vec!["open BTCUSDT long", "close BTCUSDT", "open BTCUSDT short"]);
    let pos = trader.book().get("BTCUSDT").unwrap();
    assert_eq!(pos.side, Side::Short);
    assert_eq!(pos.stop_loss, 103.0);
    assert_eq!(store.trades()[0].reason, ExitReason::OppositeSignal);
}

#[tokio::test]
async fn filtered_flip_closes_the_opposite_position_without_reversing() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    venue.set_price(99.0);
    let flip = Analysis { filtered: true, ..view(Signal::EnterShort, 2, 99.0, 2.0) };
    let outcome = trader.step("BTCUSDT", &flip).await.unwrap();

    assert_eq!(outcome.exit, Some(ExitReason::OppositeSignal));
    assert_eq!(outcome.entry, None);
    assert_eq!(outcome.skipped.as_deref(), Some("volatility filter"));
    assert_eq!(venue.orders(), vec!["open BTCUSDT long", "close BTCUSDT"]);
    assert!(trader.book().get("BTCUSDT").is_none());
    assert_eq!(trader.book().last_signal("BTCUSDT"), Some(2));
    assert_eq!(store.trades()[0].reason, ExitReason::OppositeSignal);
}

#[tokio::test]
async fn filtered_flip_from_flat_is_consumed() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    let flip = Analysis { filtered: true, ..view(Signal::EnterLong, 1, 100.0, 2.0) };

    let outcome = trader.step("BTCUSDT", &flip).await.unwrap();
    assert!(outcome.skipped.is_some());
    assert!(venue.orders().is_empty());
    assert_eq!(trader.book().last_signal("BTCUSDT"), Some(1));

    let outcome = trader.step("BTCUSDT", &flip).await.unwrap();
    assert_eq!(outcome, Default::default());
}

#[tokio::test]
async fn failed_entry_is_retried_next_cycle() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    let a = view(Signal::EnterLong, 1, 100.0, 2.0);

    venue.state.lock().unwrap().fail_orders = true;
    let outcome = trader.step("BTCUSDT", &a).await.unwrap();
    assert!(outcome.failed.is_some());
    assert!(trader.book().get("BTCUSDT").is_none());
    assert_eq!(trader.book().last_signal("BTCUSDT"), None);

    venue.state.lock().unwrap().fail_orders = false;
    let outcome = trader.step("BTCUSDT", &a).await.unwrap();
    assert_eq!(outcome.entry, Some(Side::Long));
}

#[tokio::test]
async fn failed_close_keeps_the_position() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    venue.state.lock().unwrap().fail_orders = true;
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 95.0, 2.0)).await.unwrap();

    assert!(outcome.failed.is_some());
    assert_eq!(outcome.exit, None);
    assert!(trader.book().get("BTCUSDT").is_some());
    assert!(store.trades().is_empty());

    venue.state.lock().unwrap().fail_orders = false;
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 3, 95.0, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, Some(ExitReason::StopLoss));
}

#[tokio::test]
async fn close_refused_on_a_flat_venue_books_the_venue_close() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    // Stop bracket filled on the venue before the engine got to it.
    venue.state.lock().unwrap().positions.clear();
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 95.0, 2.0)).await.unwrap();

    assert_eq!(outcome.exit, Some(ExitReason::ClosedOnVenue));
    assert_eq!(outcome.failed, None);
    assert!(trader.book().get("BTCUSDT").is_none());
    let trades = store.trades();
    assert_eq!(trades[0].reason, ExitReason::ClosedOnVenue);
    assert_eq!(trades[0].exit_price, 95.0);
}

#[tokio::test]
async fn degenerate_risk_consumes_the_signal() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    let a = view(Signal::EnterLong, 1, 100.0, 0.0);

    let outcome = trader.step("BTCUSDT", &a).await.unwrap();
    assert!(outcome.skipped.is_some());
    assert_eq!(trader.book().last_signal("BTCUSDT"), Some(1));

    let outcome = trader.step("BTCUSDT", &a).await.unwrap();
    assert_eq!(outcome, Default::default());
    assert!(venue.orders().is_empty());
}

#[tokio::test]
async fn quantity_below_venue_minimum_is_skipped() {
    let venue = MockVenue::new(100.0);
    venue.state.lock().unwrap().balance = 20.0;
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    // 20 * 0.02 = 0.4 notional, 0.004 units, order value below 7.
    let outcome = trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    assert!(outcome.skipped.is_some());
    assert!(venue.orders().is_empty());
}

#[tokio::test]
async fn position_cap_skips_new_entries() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut config = make_config();
    config.risk.max_positions = 1;
    let mut trader = make_trader_with(&venue, &store, &["BTCUSDT", "ETHUSDT"], config);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    let outcome = trader.step("ETHUSDT", &view(Signal::EnterShort, 1, 100.0, 2.0)).await.unwrap();
    assert!(outcome.skipped.is_some());
    assert_eq!(trader.book().open_count(), 1);
    assert_eq!(venue.orders().len(), 1);
}

#[tokio::test]
async fn time_exit_after_max_bars() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut config = make_config();
    config.supertrend.max_bars_in_trade = 2;
    let mut trader = make_trader_with(&venue, &store, &["BTCUSDT"], config);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 100.5, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, None);
    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 3, 100.5, 2.0)).await.unwrap();
    assert_eq!(outcome.exit, Some(ExitReason::TimeExit));
}

#[tokio::test]
async fn persistence_failure_is_fatal_for_the_step() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    store.fail(true);

    let err = trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
}

// ─── Reconciliation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn crash_recovery_adopts_venue_position() {
    let venue = MockVenue::new(104.0);
    venue
        .state
        .lock()
        .unwrap()
        .positions
        .insert("BTCUSDT".into(), venue_long("BTCUSDT", 100.0, Some(104.0)));
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.restore().await.unwrap();
    let report = trader.reconcile().await.unwrap();
    assert_eq!(report.adopted, vec!["BTCUSDT".to_string()]);

    let pos = trader.book().get("BTCUSDT").unwrap();
    assert_eq!(pos.side, Side::Long);
    assert_eq!(pos.entry_price, 100.0);
    assert_eq!(pos.highest_favorable_price, 104.0);
    assert!(pos.levels_pending);
    assert!(store.saved().unwrap().positions["BTCUSDT"].is_some());

    let outcome = trader.step("BTCUSDT", &view(Signal::NoSignal, 5, 104.0, 2.0)).await.unwrap();
    assert_eq!(outcome, Default::default());
    let pos = trader.book().get("BTCUSDT").unwrap();
    assert!(!pos.levels_pending);
    assert_eq!(pos.stop_loss, 96.0);
    assert_eq!(pos.take_profit, 108.0);
    assert_eq!(pos.trailing_stop, 100.0);
    assert!(venue.orders().is_empty());
}

#[tokio::test]
async fn adopted_position_without_levels_alerts_once() {
    let venue = MockVenue::new(100.0);
    venue
        .state
        .lock()
        .unwrap()
        .positions
        .insert("BTCUSDT".into(), venue_long("BTCUSDT", 100.0, Some(100.0)));
    let store = MemoryStore::new();
    let (events, mut rx) = broadcast::channel(16);
    let mut trader = make_trader(&venue, &store).with_events(events);

    trader.reconcile().await.unwrap();
    assert!(matches!(rx.try_recv(), Ok(TradeEvent::PositionAdopted { .. })));

    // Zero ATR: no levels can be derived.
    trader.step("BTCUSDT", &view(Signal::NoSignal, 5, 90.0, 0.0)).await.unwrap();
    trader.step("BTCUSDT", &view(Signal::NoSignal, 6, 90.0, 0.0)).await.unwrap();
    match rx.try_recv() {
        Ok(TradeEvent::Unprotected { symbol, error }) => {
            assert_eq!(symbol, "BTCUSDT");
            assert!(error.contains("ATR"));
        }
        other => panic!("expected an unprotected alert, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());
    assert!(trader.book().get("BTCUSDT").unwrap().levels_pending);

    trader.step("BTCUSDT", &view(Signal::NoSignal, 7, 100.0, 2.0)).await.unwrap();
    assert!(!trader.book().get("BTCUSDT").unwrap().levels_pending);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn venue_side_close_marks_flat_and_journals() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    trader.step("BTCUSDT", &view(Signal::NoSignal, 2, 107.0, 2.0)).await.unwrap();
    // Take profit filled on the venue.
    venue.state.lock().unwrap().positions.clear();

    let report = trader.reconcile().await.unwrap();
    assert_eq!(report.closed_on_venue, vec!["BTCUSDT".to_string()]);
    assert!(trader.book().get("BTCUSDT").is_none());
    let trades = store.trades();
    assert_eq!(trades[0].reason, ExitReason::ClosedOnVenue);
    assert_eq!(trades[0].exit_price, 107.0);
    assert_eq!(store.saved().unwrap().positions["BTCUSDT"], None);
}

#[tokio::test]
async fn side_mismatch_resolves_to_the_venue() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    trader.step("BTCUSDT", &view(Signal::EnterShort, 1, 100.0, 2.0)).await.unwrap();
    venue
        .state
        .lock()
        .unwrap()
        .positions
        .insert("BTCUSDT".into(), venue_long("BTCUSDT", 101.0, None));

    let report = trader.reconcile().await.unwrap();
    assert_eq!(report.adopted.len(), 1);
    let pos = trader.book().get("BTCUSDT").unwrap();
    assert_eq!(pos.side, Side::Long);
    assert_eq!(pos.highest_favorable_price, 101.0);
}

#[tokio::test]
async fn venue_outage_during_reconcile_changes_nothing() {
    let venue = MockVenue::new(100.0);
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();
    venue.state.lock().unwrap().fail_reads = true;

    assert!(trader.reconcile().await.is_err());
    assert!(trader.book().get("BTCUSDT").is_some());
}

// ─── Full cycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn cycle_fetches_analyses_and_enters() {
    let venue = MockVenue::new(80.0);
    venue
        .state
        .lock()
        .unwrap()
        .candles
        .insert("BTCUSDT".into(), make_candles(10, 100.0, &[80.0]));
    let store = MemoryStore::new();
    let mut trader = make_trader_with(&venue, &store, &["BTCUSDT", "FOOUSDT"], make_config());

    let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
    let report = trader.run_cycle_at(now).await.unwrap();

    assert_eq!(report.steps["BTCUSDT"].entry, Some(Side::Short));
    assert!(report.skipped.contains_key("FOOUSDT"));
    assert_eq!(venue.orders(), vec!["open BTCUSDT short"]);

    // Same candles next cycle: the flip was consumed.
    let report = trader.run_cycle_at(now).await.unwrap();
    assert_eq!(report.steps["BTCUSDT"], Default::default());
    assert_eq!(venue.orders().len(), 1);
}

#[tokio::test]
async fn cycle_skips_symbols_without_enough_history() {
    let venue = MockVenue::new(100.0);
    venue
        .state
        .lock()
        .unwrap()
        .candles
        .insert("BTCUSDT".into(), make_candles(3, 100.0, &[]));
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);

    let report = trader.run_cycle_at(Utc.timestamp_opt(1_800_000_000, 0).unwrap()).await.unwrap();
    assert!(report.steps.is_empty());
    assert!(report.skipped["BTCUSDT"].contains("insufficient data"));
}

#[tokio::test]
async fn persistence_failure_aborts_the_cycle() {
    let venue = MockVenue::new(80.0);
    venue
        .state
        .lock()
        .unwrap()
        .candles
        .insert("BTCUSDT".into(), make_candles(10, 100.0, &[80.0]));
    let store = MemoryStore::new();
    store.fail(true);
    let mut trader = make_trader(&venue, &store);

    let err = trader.run_cycle_at(Utc.timestamp_opt(1_800_000_000, 0).unwrap()).await.unwrap_err();
    assert!(err.is_persistence());
}

#[tokio::test]
async fn reconcile_outage_does_not_block_protective_exits() {
    let venue = MockVenue::new(100.0);
    venue
        .state
        .lock()
        .unwrap()
        .candles
        .insert("BTCUSDT".into(), make_candles(10, 100.0, &[95.0]));
    let store = MemoryStore::new();
    let mut trader = make_trader(&venue, &store);
    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 2.0)).await.unwrap();

    venue.set_price(95.0);
    venue.state.lock().unwrap().fail_reads = true;
    let report = trader.run_cycle_at(Utc.timestamp_opt(1_800_000_000, 0).unwrap()).await.unwrap();

    assert!(report.reconcile.is_empty());
    assert_eq!(report.steps["BTCUSDT"].exit, Some(ExitReason::StopLoss));
    assert!(trader.book().get("BTCUSDT").is_none());
    assert_eq!(store.trades()[0].reason, ExitReason::StopLoss);
}

#[tokio::test]
async fn volatility_filter_blocks_the_reversal_but_not_the_exit() {
    // Choppy bars, then calm bars, then a flip down on a below-median ATR.
    let mut closes: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 100.0 } else { 110.0 }).collect();
    closes.extend([100.0; 10]);
    closes.push(90.0);
    let venue = MockVenue::new(100.0);
    venue
        .state
        .lock()
        .unwrap()
        .candles
        .insert("BTCUSDT".into(), make_candles(0, 0.0, &closes));
    let store = MemoryStore::new();
    let mut config = make_config();
    config.supertrend.volatility_filter_enabled = true;
    config.supertrend.volatility_median_window = 10;
    let mut trader = make_trader_with(&venue, &store, &["BTCUSDT"], config);

    // Floor at 80, so only the flip can close this long.
    trader.step("BTCUSDT", &view(Signal::EnterLong, 1, 100.0, 10.0)).await.unwrap();
    venue.set_price(90.0);
    let report = trader.run_cycle_at(Utc.timestamp_opt(1_800_000_000, 0).unwrap()).await.unwrap();

    let step = &report.steps["BTCUSDT"];
    assert_eq!(step.exit, Some(ExitReason::OppositeSignal));
    assert_eq!(step.entry, None);
    assert_eq!(step.skipped.as_deref(), Some("volatility filter"));
    assert_eq!(venue.orders(), vec!["open BTCUSDT long", "close BTCUSDT"]);
    assert!(trader.book().get("BTCUSDT").is_none());
}
