//! # engine::dca
//!
//! **Strategy Engine**: runs DCA ladders, one strategy per (account, market).
//!
//! A cycle opens at the current mid price P0 with a base market buy, a
//! reduce-only take-profit above P0, the safety rungs below it and, when
//! configured, a reduce-only stop.  Every rung fill moves the weighted-average
//! entry and the take-profit is cancelled and re-placed at the new target.
//! A take-profit or stop fill closes the cycle: the remaining orders are
//! cancelled, the ledger resets and a new cycle opens as soon as a price is
//! known.
//!
//! Each strategy sits behind its own `Mutex`, so event handlers for the same
//! strategy never interleave while handlers for different strategies do.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::ladder;
use crate::cache::TickerCache;
use crate::error::{AppError, AppResult};
use crate::exchange::ExchangeService;
use crate::models::{
    AccountId, Execution, Order, OrderRequest, OrderSide, OrderStatus, Strategy,
    StrategyId, StrategyOptions,
};

type Handle = Arc<Mutex<Strategy>>;

/// Registry entry.  Account and market never change, so lookups by them do
/// not need the strategy lock.
struct Entry {
    account_id: AccountId,
    market:     String,
    handle:     Handle,
}

pub struct StrategyEngine {
    exchange:   Arc<ExchangeService>,
    tickers:    Arc<TickerCache>,
    strategies: RwLock<HashMap<StrategyId, Entry>>,
}

impl StrategyEngine {
    pub fn new(exchange: Arc<ExchangeService>, tickers: Arc<TickerCache>) -> Self {
        Self {
            exchange,
            tickers,
            strategies: RwLock::new(HashMap::new()),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Validate and register a strategy.  Nothing is sent to the exchange
    /// until the first evaluation.
    pub async fn create_strategy(
        &self,
        account_id: AccountId,
        market: &str,
        options: &StrategyOptions,
    ) -> AppResult<Strategy> {
        let params = options.validate()?;
        let strategy = Strategy::new(account_id, market, params);
        info!(
            strategy_id = %strategy.id,
            account_id  = %account_id,
            market,
            rungs       = strategy.params.max_safety_orders,
            "📒 Strategy created"
        );
        let entry = Entry {
            account_id,
            market: market.to_string(),
            handle: Arc::new(Mutex::new(strategy.clone())),
        };
        self.strategies.write().await.insert(strategy.id, entry);
        Ok(strategy)
    }

    pub async fn get_strategy(&self, id: StrategyId) -> AppResult<Strategy> {
        let handle = self.handle(id).await?;
        let strategy = handle.lock().await;
        Ok(strategy.clone())
    }

    pub async fn list_strategies(&self, account_id: Option<AccountId>) -> Vec<Strategy> {
        let handles: Vec<Handle> = self
            .strategies
            .read()
            .await
            .values()
            .filter(|e| account_id.map_or(true, |id| e.account_id == id))
            .map(|e| e.handle.clone())
            .collect();
        let mut strategies = Vec::with_capacity(handles.len());
        for handle in handles {
            strategies.push(handle.lock().await.clone());
        }
        strategies.sort_by_key(|s| s.created_at);
        strategies
    }

    /// Unregister a strategy and cancel whatever it still has on the book.
    pub async fn remove_strategy(&self, id: StrategyId) -> AppResult<Strategy> {
        let entry = self
            .strategies
            .write()
            .await
            .remove(&id)
            .ok_or(AppError::StrategyNotFound(id))?;
        let mut strategy = entry.handle.lock().await;
        self.cancel_ledger(&mut strategy).await;
        info!(strategy_id = %id, "🗑️ Strategy removed");
        Ok(strategy.clone())
    }

    async fn handle(&self, id: StrategyId) -> AppResult<Handle> {
        self.strategies
            .read()
            .await
            .get(&id)
            .map(|e| e.handle.clone())
            .ok_or(AppError::StrategyNotFound(id))
    }

    /// Any strategy registered on (account, market).
    pub async fn is_watching(&self, account_id: AccountId, market: &str) -> bool {
        self.strategies
            .read()
            .await
            .values()
            .any(|e| e.account_id == account_id && e.market == market)
    }

    async fn watching(&self, account_id: AccountId, market: &str) -> Vec<Handle> {
        self.strategies
            .read()
            .await
            .values()
            .filter(|e| e.account_id == account_id && e.market == market)
            .map(|e| e.handle.clone())
            .collect()
    }

    // ─── Evaluation ──────────────────────────────────────────────────────────

    /// Open a cycle at the cached mid price unless one is already running.
    /// Without a two-sided quote this waits for the next `ticker.updated`.
    pub async fn evaluate(&self, id: StrategyId) -> AppResult<()> {
        let handle = self.handle(id).await?;
        let mut strategy = handle.lock().await;
        if strategy.ledger.is_active() {
            return Ok(());
        }
        match self.tickers.get_price(strategy.account_id, &strategy.market).await? {
            Some(price) => self.open_cycle(&mut strategy, price).await,
            None => {
                debug!(strategy_id = %id, "No price yet, evaluation deferred");
                Ok(())
            }
        }
    }

    async fn open_cycle(&self, strategy: &mut Strategy, p0: f64) -> AppResult<()> {
        strategy.cycles += 1;
        info!(
            strategy_id = %strategy.id,
            market      = %strategy.market,
            p0,
            cycle       = strategy.cycles,
            "📈 Opening ladder cycle"
        );
        if let Err(err) = self.place_cycle(strategy, p0).await {
            error!(strategy_id = %strategy.id, error = %err, "❌ Ladder placement failed, unwinding");
            self.cancel_ledger(strategy).await;
            return Err(err);
        }
        Ok(())
    }

    async fn place_cycle(&self, strategy: &mut Strategy, p0: f64) -> AppResult<()> {
        let account_id = strategy.account_id;
        let market = strategy.market.clone();
        let params = strategy.params.clone();
        let mode = params.currency_mode;

        // ── 1. Base market order ─────────────────────────────────────────────
        let base_quantity = ladder::quantity(mode, params.base_order_size, p0);
        let base = self
            .exchange
            .open_order(account_id, &OrderRequest::market(&market, OrderSide::Buy, base_quantity))
            .await?;
        strategy.ledger.orders.insert(base.id);

        // ── 2. Take-profit above P0 ──────────────────────────────────────────
        let target = ladder::take_profit_price(p0, params.take_profit_pct);
        let take_profit = self
            .exchange
            .open_order(
                account_id,
                &OrderRequest::limit(&market, OrderSide::Sell, base_quantity, target).reduce_only(),
            )
            .await?;
        strategy.ledger.orders.insert(take_profit.id.clone());
        strategy.ledger.take_profit = Some(take_profit.id);

        // ── 3. Safety rungs below P0 ─────────────────────────────────────────
        let mut exposure = base_quantity;
        for rung in ladder::rungs(&params) {
            let price = rung.price(p0);
            let quantity = ladder::quantity(mode, rung.size, price);
            let order = self
                .exchange
                .open_order(account_id, &OrderRequest::limit(&market, OrderSide::Buy, quantity, price))
                .await?;
            debug!(strategy_id = %strategy.id, rung = rung.index, price, quantity, "Safety rung placed");
            strategy.ledger.orders.insert(order.id);
            exposure += quantity;
        }

        // ── 4. Optional stop below the ladder ────────────────────────────────
        if let Some(stop_loss_pct) = params.stop_loss_pct {
            let trigger = ladder::stop_loss_price(p0, stop_loss_pct);
            let stop = self
                .exchange
                .open_order(
                    account_id,
                    &OrderRequest::stop_market(&market, OrderSide::Sell, exposure, trigger).reduce_only(),
                )
                .await?;
            strategy.ledger.orders.insert(stop.id.clone());
            strategy.ledger.stop_loss = Some(stop.id);
        }
        Ok(())
    }

    /// Best-effort cancel of every live ledger order, then reset the ledger.
    async fn cancel_ledger(&self, strategy: &mut Strategy) {
        let ledger = std::mem::take(&mut strategy.ledger);
        for order_id in &ledger.orders {
            if let Err(err) = self
                .exchange
                .cancel_order(strategy.account_id, order_id, &strategy.market)
                .await
            {
                warn!(strategy_id = %strategy.id, order_id = %order_id, error = %err, "⚠️ Cancel failed");
            }
        }
    }

    // ─── Event reactions ─────────────────────────────────────────────────────

    /// `ticker.updated`: strategies on this market without a running cycle
    /// open one at `price`.
    pub async fn on_ticker(&self, account_id: AccountId, market: &str, price: f64) {
        for handle in self.watching(account_id, market).await {
            let mut strategy = handle.lock().await;
            if strategy.ledger.is_active() {
                continue;
            }
            if let Err(err) = self.open_cycle(&mut strategy, price).await {
                error!(strategy_id = %strategy.id, error = %err, "❌ Evaluation on ticker failed");
            }
        }
    }

    /// `execution.received`: advance the strategy that owns the order.
    pub async fn on_execution(&self, account_id: AccountId, execution: &Execution) {
        for handle in self.watching(account_id, &execution.market).await {
            let mut strategy = handle.lock().await;
            if !strategy.ledger.contains(&execution.order_id) {
                continue;
            }
            if let Err(err) = self.handle_fill(&mut strategy, execution).await {
                error!(
                    strategy_id = %strategy.id,
                    order_id    = %execution.order_id,
                    error       = %err,
                    "❌ Fill handling failed"
                );
            }
        }
    }

    /// Order pushes: an order cancelled or rejected outside the engine
    /// leaves the ledger.
    pub async fn on_order_updates(&self, account_id: AccountId, orders: &[Order]) {
        for order in orders {
            if !matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                continue;
            }
            for handle in self.watching(account_id, &order.market).await {
                let mut strategy = handle.lock().await;
                if strategy.ledger.forget(&order.id) {
                    warn!(
                        strategy_id = %strategy.id,
                        order_id    = %order.id,
                        status      = ?order.status,
                        "⚠️ Ledger order closed outside the engine"
                    );
                }
            }
        }
    }

    async fn handle_fill(&self, strategy: &mut Strategy, execution: &Execution) -> AppResult<()> {
        let order_id = execution.order_id.as_str();
        let closes_cycle = strategy.ledger.take_profit.as_deref() == Some(order_id)
            || strategy.ledger.stop_loss.as_deref() == Some(order_id);

        if closes_cycle {
            if !execution.completes_order() {
                debug!(strategy_id = %strategy.id, order_id, "Partial exit fill");
                return Ok(());
            }
            strategy.ledger.forget(order_id);
            info!(
                strategy_id = %strategy.id,
                order_id,
                price       = execution.price,
                average     = ?strategy.ledger.average_entry(),
                "🏁 Ladder cycle closed"
            );
            self.cancel_ledger(strategy).await;
            return match self.tickers.get_price(strategy.account_id, &strategy.market).await {
                Ok(Some(price)) => self.open_cycle(strategy, price).await,
                Ok(None) => {
                    debug!(strategy_id = %strategy.id, "No price, next cycle waits for a ticker");
                    Ok(())
                }
                Err(err) => {
                    warn!(strategy_id = %strategy.id, error = %err, "⚠️ No ticker for the next cycle");
                    Ok(())
                }
            };
        }

        // A rung fill, base order included.
        strategy.ledger.record_fill(execution.price, execution.quantity);
        if execution.completes_order() {
            strategy.ledger.orders.remove(order_id);
        }
        self.replace_take_profit(strategy).await
    }

    /// Cancel the current take-profit and place a new one at the weighted
    /// average entry for the whole filled quantity.
    async fn replace_take_profit(&self, strategy: &mut Strategy) -> AppResult<()> {
        let Some(average) = strategy.ledger.average_entry() else {
            return Ok(());
        };
        if let Some(previous) = strategy.ledger.take_profit.take() {
            strategy.ledger.orders.remove(&previous);
            if let Err(err) = self
                .exchange
                .cancel_order(strategy.account_id, &previous, &strategy.market)
                .await
            {
                warn!(strategy_id = %strategy.id, order_id = %previous, error = %err, "⚠️ Old take-profit cancel failed");
            }
        }

        let target = ladder::take_profit_price(average, strategy.params.take_profit_pct);
        let quantity = strategy.ledger.filled_quantity;
        let order = self
            .exchange
            .open_order(
                strategy.account_id,
                &OrderRequest::limit(&strategy.market, OrderSide::Sell, quantity, target).reduce_only(),
            )
            .await?;
        info!(
            strategy_id = %strategy.id,
            average,
            target,
            quantity,
            "♻️ Take-profit replaced"
        );
        strategy.ledger.orders.insert(order.id.clone());
        strategy.ledger.take_profit = Some(order.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::exchange::AdapterError;
    use crate::models::OrderType;
    use crate::testkit::Harness;

    const MARKET: &str = "BTCUSDT";

    fn options() -> StrategyOptions {
        StrategyOptions {
            currency_mode: Some("base".into()),
            base_order_size: Some(1.0),
            safety_order_size: Some(1.0),
            initial_offset_pct: Some(1.0),
            step_scale: Some(1.5),
            volume_scale: Some(2.0),
            take_profit_pct: Some(1.0),
            max_safety_orders: Some(3),
            stop_loss_pct: None,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn fill(order: &Order, price: f64, quantity: f64, remaining: f64) -> Execution {
        Execution {
            order_id: order.id.clone(),
            link_id: None,
            market: order.market.clone(),
            side: order.side,
            price,
            quantity,
            remaining,
            executed_at: Utc::now(),
        }
    }

    /// Paper venue quoting 99/101 (mid 100) with the ticker cache on it.
    async fn setup() -> (Harness, StrategyEngine, AccountId) {
        let h = Harness::new();
        h.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let id = h.add_account("a").await;
        let tickers = Arc::new(TickerCache::new(h.exchange.clone(), h.bus.clone()));
        tickers.start_tracking_account(id).await.unwrap();
        tickers.track_market(id, MARKET).await.unwrap();
        let engine = StrategyEngine::new(h.exchange.clone(), tickers);
        (h, engine, id)
    }

    fn venue_order(h: &Harness, id: AccountId, order_id: &str) -> Order {
        h.venue
            .orders(id)
            .into_iter()
            .find(|o| o.id == order_id)
            .unwrap()
    }

    fn safety_rungs(h: &Harness, id: AccountId) -> Vec<Order> {
        h.venue
            .orders(id)
            .into_iter()
            .filter(|o| o.order_type == OrderType::Limit && o.side == OrderSide::Buy)
            .collect()
    }

    fn base_order(h: &Harness, id: AccountId) -> Order {
        h.venue
            .orders(id)
            .into_iter()
            .find(|o| o.order_type == OrderType::Market)
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_options_make_no_exchange_calls() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        let tickers = Arc::new(TickerCache::new(h.exchange.clone(), h.bus.clone()));
        let engine = StrategyEngine::new(h.exchange.clone(), tickers);

        let mut bad = options();
        bad.volume_scale = Some(-1.0);
        let err = engine.create_strategy(id, MARKET, &bad).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidStrategy(_)));
        assert!(h.venue.calls().is_empty());
        assert!(engine.list_strategies(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_first_evaluation_places_ladder() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert_eq!(strategy.cycles, 1);
        assert_eq!(strategy.ledger.orders.len(), 5);
        assert_eq!(h.venue.call_count(id, "openOrder"), 5);

        let tp_id = strategy.ledger.take_profit.clone().unwrap();
        let tp = venue_order(&h, id, &tp_id);
        assert_eq!(tp.side, OrderSide::Sell);
        assert!(tp.reduce_only);
        assert!(close(tp.price.unwrap(), 101.0));

        let rungs = safety_rungs(&h, id);
        let prices: Vec<f64> = rungs.iter().map(|o| o.price.unwrap()).collect();
        let sizes: Vec<f64> = rungs.iter().map(|o| o.quantity).collect();
        assert!(close(prices[0], 99.0));
        assert!(close(prices[1], 98.5));
        assert!(close(prices[2], 96.75));
        assert_eq!(sizes, vec![1.0, 2.0, 4.0]);
    }

    #[tokio::test]
    async fn test_stop_loss_is_reduce_only_stop() {
        let (h, engine, id) = setup().await;
        let mut opts = options();
        opts.stop_loss_pct = Some(10.0);
        let strategy = engine.create_strategy(id, MARKET, &opts).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        let stop = venue_order(&h, id, strategy.ledger.stop_loss.as_deref().unwrap());
        assert_eq!(stop.order_type, OrderType::StopMarket);
        assert!(stop.reduce_only);
        assert!(close(stop.trigger_price.unwrap(), 90.0));
        assert_eq!(stop.quantity, 8.0);
    }

    #[tokio::test]
    async fn test_rung_fill_replaces_take_profit_at_average() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        let first_tp = engine.get_strategy(strategy.id).await.unwrap().ledger.take_profit.unwrap();

        let base = base_order(&h, id);
        let rung = safety_rungs(&h, id).remove(0);
        engine.on_execution(id, &fill(&base, 100.0, 1.0, 0.0)).await;
        engine.on_execution(id, &fill(&rung, 90.0, 1.0, 0.0)).await;

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert_eq!(strategy.ledger.average_entry(), Some(95.0));
        assert!(!strategy.ledger.contains(&base.id));
        assert!(!strategy.ledger.contains(&rung.id));

        let tp_id = strategy.ledger.take_profit.clone().unwrap();
        assert_ne!(tp_id, first_tp);
        assert!(strategy.ledger.contains(&tp_id));
        let tp = venue_order(&h, id, &tp_id);
        assert!(close(tp.price.unwrap(), 95.95));
        assert_eq!(tp.quantity, 2.0);
        assert_eq!(venue_order(&h, id, &first_tp).status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_partial_fill_keeps_rung_in_ledger() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();

        let rung = safety_rungs(&h, id).remove(1);
        engine.on_execution(id, &fill(&rung, 98.5, 0.5, 1.5)).await;

        let after = engine.get_strategy(strategy.id).await.unwrap();
        assert!(after.ledger.contains(&rung.id));
        assert_eq!(after.ledger.filled_quantity, 0.5);

        engine.on_execution(id, &fill(&rung, 98.5, 1.5, 0.0)).await;
        let after = engine.get_strategy(strategy.id).await.unwrap();
        assert!(!after.ledger.contains(&rung.id));
        assert_eq!(after.ledger.filled_quantity, 2.0);
    }

    #[tokio::test]
    async fn test_take_profit_fill_closes_and_reopens() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        let base = base_order(&h, id);
        engine.on_execution(id, &fill(&base, 100.0, 1.0, 0.0)).await;

        let tp_id = engine.get_strategy(strategy.id).await.unwrap().ledger.take_profit.unwrap();
        let tp = venue_order(&h, id, &tp_id);
        engine.on_execution(id, &fill(&tp, 101.0, 1.0, 0.0)).await;

        let first_cycle_rungs: Vec<Order> = safety_rungs(&h, id).into_iter().take(3).collect();
        assert!(first_cycle_rungs.iter().all(|o| o.status == OrderStatus::Cancelled));

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert_eq!(strategy.cycles, 2);
        assert_eq!(strategy.ledger.filled_quantity, 0.0);
        assert_eq!(strategy.ledger.orders.len(), 5);
        assert!(first_cycle_rungs.iter().all(|o| !strategy.ledger.contains(&o.id)));
    }

    #[tokio::test]
    async fn test_stop_loss_fill_closes_and_reopens() {
        let (h, engine, id) = setup().await;
        let mut opts = options();
        opts.stop_loss_pct = Some(10.0);
        let strategy = engine.create_strategy(id, MARKET, &opts).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        let base = base_order(&h, id);
        engine.on_execution(id, &fill(&base, 100.0, 1.0, 0.0)).await;

        let before = engine.get_strategy(strategy.id).await.unwrap();
        let tp_id = before.ledger.take_profit.clone().unwrap();
        let stop = venue_order(&h, id, before.ledger.stop_loss.as_deref().unwrap());
        engine.on_execution(id, &fill(&stop, 90.0, 8.0, 0.0)).await;

        let first_cycle_rungs: Vec<Order> = safety_rungs(&h, id).into_iter().take(3).collect();
        assert!(first_cycle_rungs.iter().all(|o| o.status == OrderStatus::Cancelled));
        assert_eq!(venue_order(&h, id, &tp_id).status, OrderStatus::Cancelled);

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert_eq!(strategy.cycles, 2);
        assert_eq!(strategy.ledger.filled_quantity, 0.0);
        assert_eq!(strategy.ledger.orders.len(), 6);
        assert!(!strategy.ledger.contains(&stop.id));
        assert_ne!(strategy.ledger.stop_loss.as_deref(), Some(stop.id.as_str()));
    }

    #[tokio::test]
    async fn test_partial_exit_fill_is_ignored() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        let base = base_order(&h, id);
        engine.on_execution(id, &fill(&base, 100.0, 1.0, 0.0)).await;
        let before = engine.get_strategy(strategy.id).await.unwrap();
        let calls_before = h.venue.calls().len();

        let tp = venue_order(&h, id, before.ledger.take_profit.as_deref().unwrap());
        engine.on_execution(id, &fill(&tp, 101.0, 0.4, 0.6)).await;

        let after = engine.get_strategy(strategy.id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.cycles, 1);
        assert_eq!(after.ledger.filled_quantity, 1.0);
        assert_eq!(h.venue.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_failed_placement_unwinds_cycle() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        // base and take-profit go through, the first safety rung is refused
        h.venue.fail_after(id, "openOrder", 2, AdapterError::Exchange("margin".into()));

        let err = engine.evaluate(strategy.id).await.unwrap_err();
        assert!(matches!(err, AppError::OperationFailed { .. }));

        let placed = h.venue.orders(id);
        assert_eq!(placed.len(), 2);
        let tp = placed.iter().find(|o| o.side == OrderSide::Sell).unwrap();
        assert_eq!(tp.status, OrderStatus::Cancelled);
        // the filled base order cannot be cancelled; that only warns
        assert_eq!(h.venue.call_count(id, "cancelOrder"), 2);
        assert_eq!(h.venue.call_count(id, "openOrder"), 3);

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert!(!strategy.ledger.is_active());
        assert!(strategy.ledger.take_profit.is_none());
        assert_eq!(strategy.cycles, 1);
    }

    #[tokio::test]
    async fn test_ladder_below_zero_is_rejected() {
        let (h, engine, id) = setup().await;
        let calls_before = h.venue.calls().len();
        let mut steep = options();
        steep.initial_offset_pct = Some(60.0);
        steep.step_scale = Some(2.0);
        steep.max_safety_orders = Some(2);

        let err = engine.create_strategy(id, MARKET, &steep).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStrategy(_)));
        assert_eq!(h.venue.calls().len(), calls_before);
        assert!(engine.list_strategies(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_execution_is_ignored() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();
        let before = engine.get_strategy(strategy.id).await.unwrap();

        let mut foreign = base_order(&h, id);
        foreign.id = "someone-else".into();
        engine.on_execution(id, &fill(&foreign, 50.0, 1.0, 0.0)).await;

        assert_eq!(engine.get_strategy(strategy.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_external_cancel_drops_order() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();

        let rung = safety_rungs(&h, id).remove(2);
        h.exchange.cancel_order(id, &rung.id, MARKET).await.unwrap();
        let cancelled = venue_order(&h, id, &rung.id);
        engine.on_order_updates(id, &[cancelled]).await;

        let strategy = engine.get_strategy(strategy.id).await.unwrap();
        assert!(!strategy.ledger.contains(&rung.id));
        assert_eq!(strategy.ledger.orders.len(), 4);
    }

    #[tokio::test]
    async fn test_ticker_opens_idle_strategy_once() {
        let (h, engine, id) = setup().await;
        engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.on_ticker(id, MARKET, 100.0).await;
        engine.on_ticker(id, MARKET, 100.5).await;
        engine.on_ticker(id, "ETHUSDT", 10.0).await;

        assert_eq!(h.venue.call_count(id, "openOrder"), 5);
    }

    #[tokio::test]
    async fn test_remove_cancels_live_orders() {
        let (h, engine, id) = setup().await;
        let strategy = engine.create_strategy(id, MARKET, &options()).await.unwrap();
        engine.evaluate(strategy.id).await.unwrap();

        engine.remove_strategy(strategy.id).await.unwrap();

        assert!(h.venue.orders(id).iter().all(|o| !o.status.is_open()));
        assert!(matches!(
            engine.get_strategy(strategy.id).await,
            Err(AppError::StrategyNotFound(_))
        ));
    }
}
