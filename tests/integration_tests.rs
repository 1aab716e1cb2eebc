//! Integration tests for the execution core
//!
//! Drives the single-leg executor, pair executor and reconciler end-to-end
//! against a scriptable mock exchange and an in-memory store: happy-path
//! entry, staged take-profit, stop-loss, pair rollback (success and
//! exhaustion), timeout handling, and restart reconciliation.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crypto_trader::clock::{Clock, ManualClock};
use crypto_trader::config::{PairTradingConfig, RiskManagementConfig};
use crypto_trader::error::ExchangeError;
use crypto_trader::exchange::{Balance, ExchangeApi, OrderResult, OrderStatus};
use crypto_trader::executor::OrderExecutor;
use crypto_trader::notify::TelegramNotifier;
use crypto_trader::pairs::PairExecutor;
use crypto_trader::positions::PositionBook;
use crypto_trader::reconcile::Reconciler;
use crypto_trader::risk::RiskController;
use crypto_trader::safe_mode::SafeModeController;
use crypto_trader::signals::{SpreadAction, SpreadSignal};
use crypto_trader::store::SqliteStore;
use crypto_trader::types::{
    OrderSide, PairStatus, Position, PositionStatus, Side, Symbol,
};

const COMMISSION: f64 = 0.0015;

// =============================================================================
// Scriptable mock exchange
// =============================================================================

/// Next order outcome; an empty script means a full fill at the mock price
enum OrderOutcome {
    Fill {
        filled: Option<f64>,
        price: Option<f64>,
    },
    Canceled,
    Timeout {
        order_id: Option<String>,
    },
    Fail(ExchangeError),
}

#[derive(Debug, Clone)]
struct PlacedOrder {
    symbol: String,
    side: OrderSide,
    amount: f64,
}

struct MockExchange {
    prices: Mutex<HashMap<String, f64>>,
    balances: Mutex<HashMap<String, f64>>,
    script: Mutex<VecDeque<OrderOutcome>>,
    placed: Mutex<Vec<PlacedOrder>>,
    status_response: Mutex<OrderStatus>,
    order_counter: Mutex<u64>,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        let mut prices = HashMap::new();
        prices.insert("BTC/JPY".to_string(), 12_000_000.0);
        prices.insert("ETH/JPY".to_string(), 500_000.0);
        prices.insert("FX_BTC_JPY".to_string(), 12_000_000.0);
        let mut balances = HashMap::new();
        balances.insert("JPY".to_string(), 10_000_000.0);
        Arc::new(MockExchange {
            prices: Mutex::new(prices),
            balances: Mutex::new(balances),
            script: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            status_response: Mutex::new(OrderStatus::Filled),
            order_counter: Mutex::new(0),
        })
    }

    fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    fn set_balance(&self, currency: &str, amount: f64) {
        self.balances.lock().unwrap().insert(currency.to_string(), amount);
    }

    fn push(&self, outcome: OrderOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn set_status_response(&self, status: OrderStatus) {
        *self.status_response.lock().unwrap() = status;
    }

    fn placed(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    fn price_of(&self, symbol: &Symbol) -> f64 {
        *self.prices.lock().unwrap().get(symbol.as_str()).unwrap_or(&0.0)
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.placed.lock().unwrap().push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            amount,
        });
        let id = {
            let mut counter = self.order_counter.lock().unwrap();
            *counter += 1;
            format!("MOCK-{}", counter)
        };
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            None | Some(OrderOutcome::Fill { filled: None, price: None }) => {
                let price = self.price_of(symbol);
                Ok(OrderResult {
                    id,
                    status: OrderStatus::Filled,
                    filled: amount,
                    amount,
                    average: Some(price),
                    price: Some(price),
                    cost: price * amount,
                    fee: price * amount * COMMISSION,
                })
            }
            Some(OrderOutcome::Fill { filled, price }) => {
                let fill_price = price.unwrap_or_else(|| self.price_of(symbol));
                let fill_amount = filled.unwrap_or(amount);
                Ok(OrderResult {
                    id,
                    status: OrderStatus::Filled,
                    filled: fill_amount,
                    amount,
                    average: Some(fill_price),
                    price: Some(fill_price),
                    cost: fill_price * fill_amount,
                    fee: fill_price * fill_amount * COMMISSION,
                })
            }
            Some(OrderOutcome::Canceled) => Ok(OrderResult {
                id,
                status: OrderStatus::Canceled,
                filled: 0.0,
                amount,
                average: None,
                price: None,
                cost: 0.0,
                fee: 0.0,
            }),
            Some(OrderOutcome::Timeout { order_id }) => Err(ExchangeError::Timeout { order_id }),
            Some(OrderOutcome::Fail(e)) => Err(e),
        }
    }

    async fn create_limit_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
        _price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        self.create_market_order(symbol, side, amount).await
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &Symbol,
    ) -> Result<OrderResult, ExchangeError> {
        let status = *self.status_response.lock().unwrap();
        Ok(OrderResult {
            id: order_id.to_string(),
            status,
            filled: 0.0,
            amount: 0.0,
            average: None,
            price: None,
            cost: 0.0,
            fee: 0.0,
        })
    }

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, ExchangeError> {
        let free = *self.balances.lock().unwrap().get(currency).unwrap_or(&0.0);
        Ok(Balance {
            free,
            used: 0.0,
            total: free,
        })
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        Ok(self.price_of(symbol))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    exchange: Arc<MockExchange>,
    store: Arc<SqliteStore>,
    book: Arc<PositionBook>,
    risk: Arc<RiskController>,
    safe_mode: Arc<SafeModeController>,
    clock: Arc<ManualClock>,
    executor: OrderExecutor,
    pairs: PairExecutor,
}

fn harness() -> Harness {
    let exchange = MockExchange::new();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let book = Arc::new(PositionBook::new(store.clone(), COMMISSION));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let risk = Arc::new(RiskController::new(
        RiskManagementConfig::default(),
        200_000.0,
        0.6,
        clock_dyn.clone(),
    ));
    let safe_mode = Arc::new(SafeModeController::default());
    let notifier = Arc::new(TelegramNotifier::disabled());
    let order_lock = Arc::new(tokio::sync::Mutex::new(()));

    let executor = OrderExecutor::new(
        exchange.clone(),
        book.clone(),
        risk.clone(),
        safe_mode.clone(),
        notifier.clone(),
        clock_dyn.clone(),
        order_lock.clone(),
    );
    let pairs = PairExecutor::new(
        exchange.clone(),
        book.clone(),
        store.clone(),
        risk.clone(),
        safe_mode.clone(),
        notifier,
        clock_dyn,
        order_lock,
        PairTradingConfig::default(),
        COMMISSION,
    );

    Harness {
        exchange,
        store,
        book,
        risk,
        safe_mode,
        clock,
        executor,
        pairs,
    }
}

async fn open_long(h: &Harness, symbol: &str, entry_price: f64) -> Position {
    h.exchange.set_price(symbol, entry_price);
    let symbol = Symbol::new(symbol);
    h.executor
        .enter(&symbol, Side::Long, entry_price, 0.9, 200_000.0)
        .await
        .unwrap()
        .expect("entry should open a position")
}

fn long_spread_signal(hedge_ratio: f64) -> SpreadSignal {
    SpreadSignal {
        z_score: -2.4,
        signal: SpreadAction::LongSpread,
        hedge_ratio,
    }
}

// =============================================================================
// Scenario 1: happy-path entry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_happy_path_entry() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");

    // exchange fills 0.00125 BTC at 12,010,000 against a 12,000,000 quote
    h.exchange.push(OrderOutcome::Fill {
        filled: Some(0.00125),
        price: Some(12_010_000.0),
    });

    let position = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.75, 200_000.0)
        .await
        .unwrap()
        .expect("entry should succeed");

    assert_eq!(position.status, PositionStatus::Open);
    assert!((position.entry_price - 12_010_000.0).abs() < 1e-6);
    assert!((position.quantity - 0.00125).abs() < 1e-9);

    // durable row agrees with memory
    let row = h.store.get_position(&position.position_id).unwrap().unwrap();
    assert_eq!(row.status, PositionStatus::Open);
    assert!((row.entry_price - 12_010_000.0).abs() < 1e-6);

    // one fill audited
    assert_eq!(h.store.trade_count().unwrap(), 1);

    // invariant: a successful order leaves the failure counter at zero
    assert_eq!(h.safe_mode.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_low_confidence_entry_refused() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let result = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.4, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.exchange.placed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_excessive_slip_aborts_entry() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    // quoted at 12,000,000 but the market moved 6%
    h.exchange.set_price("BTC/JPY", 12_720_000.0);
    let result = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.8, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.exchange.placed().is_empty());
}

// =============================================================================
// Scenario 2: staged take-profit
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_staged_take_profit() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let opened = open_long(&h, "BTC/JPY", 10_000_000.0).await;
    let original_quantity = opened.quantity;

    // +15%: first stage closes half
    h.exchange.set_price("BTC/JPY", 11_500_000.0);
    h.executor.manage_existing(&btc, 11_500_000.0).await.unwrap();

    let position = h.book.get(&btc).expect("position should remain open");
    assert!((position.quantity - original_quantity * 0.5).abs() < 1e-12);

    // same price again: stage one is spent, nothing more closes
    h.executor.manage_existing(&btc, 11_500_000.0).await.unwrap();
    let position = h.book.get(&btc).unwrap();
    assert!((position.quantity - original_quantity * 0.5).abs() < 1e-12);

    // +25%: second stage closes the rest
    h.exchange.set_price("BTC/JPY", 12_500_000.0);
    h.executor.manage_existing(&btc, 12_500_000.0).await.unwrap();
    assert!(h.book.get(&btc).is_none());

    // entry fill + partial fill + final fill
    assert_eq!(h.store.trade_count().unwrap(), 3);
    let row = h.store.get_position(&opened.position_id).unwrap().unwrap();
    assert_eq!(row.status, PositionStatus::Closed);
}

// =============================================================================
// Scenario 3: stop-loss on a short
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_loss_short() {
    let h = harness();
    let fx = Symbol::new("FX_BTC_JPY");
    h.exchange.set_price("FX_BTC_JPY", 10_000_000.0);

    // capital sized so the computed quantity clears the FX minimum lot
    let position = h
        .executor
        .enter(&fx, Side::Short, 10_000_000.0, 0.8, 600_000.0)
        .await
        .unwrap()
        .expect("short entry on a leveraged product should succeed");
    assert_eq!(position.side, Side::Short);

    // +10.5% against the short crosses the 10% stop
    h.exchange.set_price("FX_BTC_JPY", 11_050_000.0);
    h.executor.manage_existing(&fx, 11_050_000.0).await.unwrap();

    assert!(h.book.get(&fx).is_none());
    let row = h.store.get_position(&position.position_id).unwrap().unwrap();
    assert_eq!(row.status, PositionStatus::Closed);
    assert!(row.realized_pnl < 0.0);
    // the loss registered with the risk controller
    assert_eq!(h.risk.snapshot().consecutive_losses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_spot_short_refused_at_entry() {
    let h = harness();
    let eth = Symbol::new("ETH/JPY");
    let result = h
        .executor
        .enter(&eth, Side::Short, 500_000.0, 0.9, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.exchange.placed().is_empty());
}

// =============================================================================
// Scenario 4: pair open, leg-2 failure, rollback succeeds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pair_rollback_succeeds() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let eth = Symbol::new("ETH/JPY");
    h.exchange.set_balance("ETH", 1.0);

    // leg 1 fills, leg 2 cancels, the rollback sell fills
    h.exchange.push(OrderOutcome::Fill { filled: None, price: None });
    h.exchange.push(OrderOutcome::Canceled);
    h.exchange.push(OrderOutcome::Fill { filled: None, price: None });

    // sizes: capital 1,200,000 x 10% / 12,000,000 = 0.01 BTC;
    // hedge 0.625 makes leg 2 = 0.01 x 0.625 x 24 = 0.15 ETH
    let result = h
        .pairs
        .open_pair(
            &btc,
            &eth,
            &long_spread_signal(0.625),
            12_000_000.0,
            500_000.0,
            1_200_000.0,
        )
        .await
        .unwrap();
    assert!(result.is_none());

    let placed = h.exchange.placed();
    assert_eq!(placed.len(), 3);
    assert_eq!(placed[0].side, OrderSide::Buy);
    assert_eq!(placed[0].symbol, "BTC/JPY");
    assert!((placed[0].amount - 0.01).abs() < 1e-9);
    assert_eq!(placed[1].side, OrderSide::Sell);
    assert_eq!(placed[1].symbol, "ETH/JPY");
    assert!((placed[1].amount - 0.15).abs() < 1e-9);
    // compensating sell of the filled BTC leg
    assert_eq!(placed[2].side, OrderSide::Sell);
    assert_eq!(placed[2].symbol, "BTC/JPY");
    assert!((placed[2].amount - 0.01).abs() < 1e-9);

    // the reservation resolved to failed and safe mode is untouched
    assert!(!h.book.has_pair("BTC/JPY_ETH/JPY"));
    assert!(!h.safe_mode.is_engaged());
    assert!(h.store.recover_incomplete_pairs().unwrap().is_empty());
    assert!(h.store.get_open_pair_positions().unwrap().is_empty());
}

// =============================================================================
// Scenario 5: pair open, rollback exhausts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pair_rollback_exhaustion_latches_safe_mode() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let eth = Symbol::new("ETH/JPY");
    h.exchange.set_balance("ETH", 1.0);

    // leg 1 fills, leg 2 cancels, all three rollback attempts cancel
    h.exchange.push(OrderOutcome::Fill { filled: None, price: None });
    h.exchange.push(OrderOutcome::Canceled);
    for _ in 0..3 {
        h.exchange.push(OrderOutcome::Canceled);
    }

    let result = h
        .pairs
        .open_pair(
            &btc,
            &eth,
            &long_spread_signal(0.625),
            12_000_000.0,
            500_000.0,
            1_200_000.0,
        )
        .await
        .unwrap();
    assert!(result.is_none());

    // leg1 + leg2 + 3 rollback attempts
    assert_eq!(h.exchange.placed().len(), 5);
    assert!(h.safe_mode.is_engaged());

    // entries are now refused without touching the exchange
    let refused = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.9, 200_000.0)
        .await
        .unwrap();
    assert!(refused.is_none());
    assert_eq!(h.exchange.placed().len(), 5);

    let second_pair = h
        .pairs
        .open_pair(
            &btc,
            &eth,
            &long_spread_signal(0.625),
            12_000_000.0,
            500_000.0,
            1_200_000.0,
        )
        .await
        .unwrap();
    assert!(second_pair.is_none());
    assert_eq!(h.exchange.placed().len(), 5);

    // a successful call does NOT clear a rollback latch
    h.safe_mode.record_api_success();
    assert!(h.safe_mode.is_engaged());
}

// =============================================================================
// Timeout handling and restart idempotence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_order_timeout_parks_position_as_unknown() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");

    // the order times out with an id, and polling never sees a terminal state
    h.exchange.push(OrderOutcome::Timeout {
        order_id: Some("LOST-1".to_string()),
    });
    h.exchange.set_status_response(OrderStatus::Open);

    let result = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.8, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());

    let unknowns = h
        .store
        .get_positions_by_status(PositionStatus::ExecutionUnknown)
        .unwrap();
    assert_eq!(unknowns.len(), 1);

    // the periodic reconciler resolves it after the grace window
    let reconciler = Reconciler::new(
        h.store.clone(),
        h.book.clone(),
        h.safe_mode.clone(),
        Arc::new(TelegramNotifier::disabled()),
        h.clock.clone(),
        false,
    );
    reconciler.reconcile_unknown_positions();
    // still inside the window: untouched
    assert_eq!(
        h.store
            .get_positions_by_status(PositionStatus::ExecutionUnknown)
            .unwrap()
            .len(),
        1
    );

    h.clock.advance(ChronoDuration::minutes(11));
    reconciler.reconcile_unknown_positions();
    assert!(h
        .store
        .get_positions_by_status(PositionStatus::ExecutionUnknown)
        .unwrap()
        .is_empty());
    let failed = h
        .store
        .get_positions_by_status(PositionStatus::ExecutionFailed)
        .unwrap();
    assert_eq!(failed.len(), 1);

    // the symbol is free for a fresh attempt; no duplicate position exists
    let position = open_long(&h, "BTC/JPY", 12_000_000.0).await;
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(h.store.get_open_positions().unwrap().len(), 2); // failed + open
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_order_id_cancels_pending() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    h.exchange.push(OrderOutcome::Timeout { order_id: None });

    let result = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.8, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());

    let failed = h
        .store
        .get_positions_by_status(PositionStatus::ExecutionFailed)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(h.safe_mode.failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_resolved_by_status_poll() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");

    h.exchange.push(OrderOutcome::Timeout {
        order_id: Some("SLOW-1".to_string()),
    });
    // polling finds the order canceled: pending row resolves to failed
    h.exchange.set_status_response(OrderStatus::Canceled);

    let result = h
        .executor
        .enter(&btc, Side::Long, 12_000_000.0, 0.8, 200_000.0)
        .await
        .unwrap();
    assert!(result.is_none());
    let failed = h
        .store
        .get_positions_by_status(PositionStatus::ExecutionFailed)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(h
        .store
        .get_positions_by_status(PositionStatus::ExecutionUnknown)
        .unwrap()
        .is_empty());
}

// =============================================================================
// Scenario 6: restart reconciliation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_reconciliation() {
    let h = harness();

    // aged pending (10 min), fresh pending (30 s), one open position
    let aged = {
        let mut p = Position::new(
            Symbol::new("BTC/JPY"),
            Side::Long,
            12_000_000.0,
            0.01,
            h.clock.now() - ChronoDuration::minutes(10),
        );
        p.status = PositionStatus::PendingExecution;
        h.store.create_position(&p).unwrap();
        p.position_id
    };
    let fresh = {
        let mut p = Position::new(
            Symbol::new("ETH/JPY"),
            Side::Long,
            500_000.0,
            0.1,
            h.clock.now() - ChronoDuration::seconds(30),
        );
        p.status = PositionStatus::PendingExecution;
        h.store.create_position(&p).unwrap();
        p.position_id
    };
    let open = {
        let mut p = Position::new(
            Symbol::new("FX_BTC_JPY"),
            Side::Short,
            12_000_000.0,
            0.05,
            h.clock.now() - ChronoDuration::hours(2),
        );
        p.status = PositionStatus::Open;
        p.stop_loss = Some(13_200_000.0);
        h.store.create_position(&p).unwrap();
        p.position_id
    };

    // one pending pair reservation
    let pair = crypto_trader::types::PairPosition {
        pair_id: "BTC/JPY_ETH/JPY".to_string(),
        symbol1: Symbol::new("BTC/JPY"),
        symbol2: Symbol::new("ETH/JPY"),
        direction: crypto_trader::types::PairDirection::LongSpread,
        hedge_ratio: 0.625,
        entry_spread: 0.0,
        entry_z_score: -2.4,
        entry_time: h.clock.now(),
        size1: 0.01,
        size2: 0.15,
        entry_price1: 12_000_000.0,
        entry_price2: 500_000.0,
        entry_capital: 120_000.0,
        unrealized_pnl: 0.0,
        max_pnl: 0.0,
        exit_price1: None,
        exit_price2: None,
        exit_time: None,
        exit_reason: None,
        realized_pnl: 0.0,
        status: PairStatus::PendingExecution,
    };
    h.store.create_pair_position(&pair).unwrap();

    // production mode: the pending pair aborts startup
    let live_reconciler = Reconciler::new(
        h.store.clone(),
        h.book.clone(),
        h.safe_mode.clone(),
        Arc::new(TelegramNotifier::disabled()),
        h.clock.clone(),
        true,
    );
    assert!(live_reconciler.startup().is_err());

    // test mode continues: aged pending fails, fresh pending survives,
    // the open position rehydrates with its stop level
    let test_reconciler = Reconciler::new(
        h.store.clone(),
        h.book.clone(),
        h.safe_mode.clone(),
        Arc::new(TelegramNotifier::disabled()),
        h.clock.clone(),
        false,
    );
    test_reconciler.startup().unwrap();

    assert_eq!(
        h.store.get_position(&aged).unwrap().unwrap().status,
        PositionStatus::ExecutionFailed
    );
    assert_eq!(
        h.store.get_position(&fresh).unwrap().unwrap().status,
        PositionStatus::PendingExecution
    );

    let restored = h.book.get(&Symbol::new("FX_BTC_JPY")).unwrap();
    assert_eq!(restored.position_id, open);
    assert_eq!(restored.stop_loss, Some(13_200_000.0));
    assert_eq!(h.book.open_count(), 1);
}

// =============================================================================
// Pair close with hedge restoration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pair_close_restores_hedge_when_leg2_fails() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let eth = Symbol::new("ETH/JPY");
    h.exchange.set_balance("ETH", 1.0);

    // clean open
    let pair = h
        .pairs
        .open_pair(
            &btc,
            &eth,
            &long_spread_signal(0.625),
            12_000_000.0,
            500_000.0,
            1_200_000.0,
        )
        .await
        .unwrap()
        .expect("pair should open");
    assert_eq!(pair.status, PairStatus::Open);
    assert!(h.book.has_pair(&pair.pair_id));

    // close: leg-1 sell fills, leg-2 buy-back cancels, compensation re-buys leg 1
    h.exchange.push(OrderOutcome::Fill { filled: None, price: None });
    h.exchange.push(OrderOutcome::Canceled);
    h.exchange.push(OrderOutcome::Fill { filled: None, price: None });

    let pnl = h
        .pairs
        .close_pair(&pair.pair_id, 12_100_000.0, 505_000.0, "take_profit")
        .await
        .unwrap();
    assert!(pnl.is_none());

    // the pair survives, hedged, still open in both memory and store
    assert!(h.book.has_pair(&pair.pair_id));
    assert_eq!(h.store.get_open_pair_positions().unwrap().len(), 1);
    assert!(!h.safe_mode.is_engaged());

    let placed = h.exchange.placed();
    let last = &placed[placed.len() - 1];
    // compensation re-entered leg 1 on its original side
    assert_eq!(last.symbol, "BTC/JPY");
    assert_eq!(last.side, OrderSide::Buy);
}

#[tokio::test(start_paused = true)]
async fn test_pair_full_lifecycle() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let eth = Symbol::new("ETH/JPY");
    h.exchange.set_balance("ETH", 1.0);

    let pair = h
        .pairs
        .open_pair(
            &btc,
            &eth,
            &long_spread_signal(0.625),
            12_000_000.0,
            500_000.0,
            1_200_000.0,
        )
        .await
        .unwrap()
        .expect("pair should open");

    let pnl = h
        .pairs
        .close_pair(&pair.pair_id, 12_100_000.0, 500_000.0, "take_profit")
        .await
        .unwrap()
        .expect("close should complete");
    // leg 1 gained 1,000 gross; fees on four executed legs come out
    assert!(pnl > 0.0 && pnl < 1_000.0);

    assert!(!h.book.has_pair(&pair.pair_id));
    assert!(h.store.get_open_pair_positions().unwrap().is_empty());
}

// =============================================================================
// Safe-mode entry blocking (single leg)
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_exits_allowed_while_safe_mode_blocks_entries() {
    let h = harness();
    let btc = Symbol::new("BTC/JPY");
    let position = open_long(&h, "BTC/JPY", 10_000_000.0).await;

    h.safe_mode
        .engage(crypto_trader::safe_mode::SafeModeReason::RollbackFailed);

    // entry path refused
    let eth = Symbol::new("ETH/JPY");
    let refused = h
        .executor
        .enter(&eth, Side::Long, 500_000.0, 0.9, 200_000.0)
        .await
        .unwrap();
    assert!(refused.is_none());

    // exit path still works
    h.exchange.set_price("BTC/JPY", 9_000_000.0);
    let closed = h
        .executor
        .close(&btc, 9_000_000.0, "stop loss")
        .await
        .unwrap();
    assert!(closed.is_some());
    let row = h.store.get_position(&position.position_id).unwrap().unwrap();
    assert_eq!(row.status, PositionStatus::Closed);
}
