//! # state
//!
//! The shared application state: every long-lived component, built once and
//! handed to the Axum handlers as `Arc<AppState>`.
//!
//! ```text
//!   push channel ─▶ EventBus ─┬─▶ cache dispatcher  ─▶ Ticker/Order/Position/Wallet caches
//!                             │                              │ …Updated events
//!                             │                              ▼
//!                             └─▶ engine dispatcher ─▶ StrategyEngine ─▶ ExchangeService
//! ```
//!
//! The two dispatchers are independent tasks so a slow exchange call in the
//! engine never holds back cache updates.  Within each dispatcher events are
//! handled in arrival order.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{spawn_refresh_loop, OrderCache, PositionCache, TickerCache, WalletCache};
use crate::config::AppConfig;
use crate::engine::StrategyEngine;
use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::exchange::paper::PaperVenue;
use crate::exchange::{ExchangeFactory, ExchangeService};
use crate::models::{Account, AccountId, Strategy, StrategyOptions};
use crate::registry::{AccountRegistry, InMemoryAccountRegistry, UpsertOutcome};
use crate::stream::{StreamManager, Topic};

// ─── AppState ─────────────────────────────────────────────────────────────────

pub struct AppState {
    pub config:    AppConfig,
    pub bus:       EventBus,
    /// Simulated venue behind every `paper` account.
    pub venue:     Arc<PaperVenue>,
    pub registry:  Arc<InMemoryAccountRegistry>,
    pub exchange:  Arc<ExchangeService>,
    pub streams:   Arc<StreamManager>,
    pub tickers:   Arc<TickerCache>,
    pub orders:    Arc<OrderCache>,
    pub positions: Arc<PositionCache>,
    pub wallets:   Arc<WalletCache>,
    pub engine:    Arc<StrategyEngine>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the components around an existing registry, factory and stream
    /// manager.
    pub fn from_parts(
        config: AppConfig,
        bus: EventBus,
        venue: Arc<PaperVenue>,
        registry: Arc<InMemoryAccountRegistry>,
        factory: ExchangeFactory,
        streams: StreamManager,
    ) -> Self {
        let exchange = Arc::new(ExchangeService::new(factory, registry.clone(), bus.clone()));
        let tickers = Arc::new(TickerCache::new(exchange.clone(), bus.clone()));
        let engine = Arc::new(StrategyEngine::new(exchange.clone(), tickers.clone()));
        Self {
            orders: Arc::new(OrderCache::new(exchange.clone(), bus.clone())),
            positions: Arc::new(PositionCache::new(exchange.clone(), bus.clone())),
            wallets: Arc::new(WalletCache::new(exchange.clone(), bus.clone())),
            streams: Arc::new(streams),
            config,
            bus,
            venue,
            registry,
            exchange,
            tickers,
            engine,
        }
    }

    /// Standard wiring: Bybit, Binance and paper adapters and connectors.
    pub fn new(config: AppConfig, registry: InMemoryAccountRegistry) -> Self {
        let bus = EventBus::new(config.event_bus_capacity);
        let venue = PaperVenue::new();
        let registry = Arc::new(registry);
        let factory = ExchangeFactory::standard(config.endpoints.clone(), venue.clone());
        let streams = StreamManager::standard(
            &config.endpoints,
            venue.clone(),
            registry.clone(),
            bus.clone(),
            config.reconnect,
        );
        Self::from_parts(config, bus, venue, registry, factory, streams)
    }

    // ── Accounts ──────────────────────────────────────────────────────────────

    /// Create or replace an account.  A credential change on a live account
    /// tears the adapter down and rebuilds it, and reopens the push channel.
    pub async fn upsert_account(&self, account: Account) -> AppResult<UpsertOutcome> {
        let account_id = account.id;
        let outcome = self.registry.upsert(account).await;
        if outcome == (UpsertOutcome::Updated { credentials_changed: true }) {
            if self.exchange.is_initialized(account_id).await {
                self.exchange.recreate(account_id).await?;
            }
            if self.streams.is_tracking(account_id).await {
                let topics = self.streams.subscriptions(account_id).await;
                self.streams.stop_tracking_account(account_id).await;
                self.streams.subscribe(account_id, &topics).await?;
            }
            info!(account_id = %account_id, "♻️ Credentials changed, exchange rebuilt");
        }
        Ok(outcome)
    }

    /// Stop everything for the account and drop it from the registry.
    pub async fn remove_account(&self, account_id: AccountId) -> AppResult<Account> {
        self.stop_tracking_account(account_id).await;
        for strategy in self.engine.list_strategies(Some(account_id)).await {
            self.engine.remove_strategy(strategy.id).await?;
        }
        let account = self.registry.get_account_by_id(account_id).await?;
        self.registry.remove(account_id).await;
        Ok(account)
    }

    /// Initialise the exchange, open the push channel and start every cache.
    pub async fn start_tracking_account(&self, account_id: AccountId) -> AppResult<()> {
        self.exchange.initialize(account_id).await?;
        self.streams.start_tracking_account(account_id).await?;
        let (tickers, orders, positions, wallet) = tokio::join!(
            self.tickers.start_tracking_account(account_id),
            self.orders.start_tracking_account(account_id),
            self.positions.start_tracking_account(account_id),
            self.wallets.start_tracking_account(account_id),
        );
        tickers?;
        orders?;
        positions?;
        wallet?;
        info!(account_id = %account_id, "🔭 Account tracked");
        Ok(())
    }

    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        self.streams.stop_tracking_account(account_id).await;
        self.tickers.stop_tracking_account(account_id).await;
        self.orders.stop_tracking_account(account_id).await;
        self.positions.stop_tracking_account(account_id).await;
        self.wallets.stop_tracking_account(account_id).await;
        self.exchange.terminate(account_id).await;
        info!(account_id = %account_id, "📴 Account untracked");
    }

    /// Watch a market's ticker: push subscription plus cache entry.  The
    /// account must already be tracked; a failed cache load takes the
    /// subscription back.
    pub async fn track_market(&self, account_id: AccountId, market: &str) -> AppResult<()> {
        if !self.tickers.is_tracked(account_id).await {
            return Err(AppError::not_tracked("ticker cache", account_id));
        }
        let topic = [Topic::ticker(market)];
        let already_subscribed = self.streams.subscriptions(account_id).await.contains(&topic[0]);
        self.streams.subscribe(account_id, &topic).await?;
        if let Err(err) = self.tickers.track_market(account_id, market).await {
            if !already_subscribed {
                self.streams.unsubscribe(account_id, &topic).await?;
                self.tickers.untrack_market(account_id, market).await?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Stop watching a market.  Refused while a strategy trades it.
    pub async fn untrack_market(&self, account_id: AccountId, market: &str) -> AppResult<()> {
        if self.engine.is_watching(account_id, market).await {
            return Err(AppError::BadRequest(format!(
                "market {market} still has strategies on account {account_id}"
            )));
        }
        self.streams.unsubscribe(account_id, &[Topic::ticker(market)]).await?;
        self.tickers.untrack_market(account_id, market).await
    }

    // ── Strategies ────────────────────────────────────────────────────────────

    /// Register a ladder, watch its market and run the first evaluation.
    /// Invalid options fail before anything reaches the exchange.
    pub async fn create_strategy(
        &self,
        account_id: AccountId,
        market: &str,
        options: &StrategyOptions,
    ) -> AppResult<Strategy> {
        self.registry.get_account_by_id(account_id).await?;
        let strategy = self.engine.create_strategy(account_id, market, options).await?;
        if let Err(err) = self.track_market(account_id, market).await {
            self.engine.remove_strategy(strategy.id).await?;
            return Err(err);
        }
        self.engine.evaluate(strategy.id).await?;
        self.engine.get_strategy(strategy.id).await
    }

    // ── Background tasks ──────────────────────────────────────────────────────

    /// Event dispatchers plus one refresh loop per cache.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let refresh = self.config.refresh;
        vec![
            self.spawn_cache_dispatcher(),
            self.spawn_engine_dispatcher(),
            spawn_refresh_loop(self.tickers.clone(), refresh.ticker),
            spawn_refresh_loop(self.orders.clone(), refresh.orders),
            spawn_refresh_loop(self.positions.clone(), refresh.positions),
            spawn_refresh_loop(self.wallets.clone(), refresh.wallet),
        ]
    }

    fn spawn_cache_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => state.apply_push(event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "⚠️ Cache dispatcher lagged, pushes lost until next refresh");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_engine_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => state.drive_engine(event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "⚠️ Engine dispatcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Route push events into the caches.
    async fn apply_push(&self, event: Event) {
        match event {
            Event::OrdersPushed { account_id, orders } => {
                self.orders.apply_push(account_id, &orders).await;
            }
            Event::PositionsPushed {
                account_id,
                positions,
            } => {
                self.positions.apply_push(account_id, &positions).await;
            }
            Event::WalletPushed { account_id, wallet } => {
                self.wallets.apply_push(account_id, &wallet).await;
            }
            Event::TickerPushed {
                account_id,
                market,
                bid,
                ask,
            } => {
                self.tickers.apply_push(account_id, &market, bid, ask).await;
            }
            _ => {}
        }
    }

    /// Route fills, cancellations and prices into the strategy engine.
    async fn drive_engine(&self, event: Event) {
        match event {
            Event::ExecutionReceived {
                account_id,
                execution,
            } => self.engine.on_execution(account_id, &execution).await,
            Event::OrdersPushed { account_id, orders } => {
                self.engine.on_order_updates(account_id, &orders).await
            }
            Event::TickerUpdated {
                account_id,
                ticker,
                price,
            } => self.engine.on_ticker(account_id, &ticker.market, price).await,
            other => debug!(event = other.name(), "Not an engine event"),
        }
    }
}

/// Build the state from configuration, seeding the registry from
/// `ACCOUNTS_FILE` when set.
pub async fn build_state(config: AppConfig) -> anyhow::Result<SharedState> {
    let registry = match &config.accounts_file {
        Some(path) => InMemoryAccountRegistry::from_file(path).await?,
        None => InMemoryAccountRegistry::new(),
    };
    Ok(Arc::new(AppState::new(config, registry)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{OrderSide, OrderType, StrategyOptions};
    use crate::stream::TrackingStatus;
    use crate::testkit::{paper_account, paper_state};

    const MARKET: &str = "BTCUSDT";

    /// Poll `check` for up to two seconds.
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

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

    #[tokio::test]
    async fn test_start_tracking_wires_channel_and_caches() {
        let state = paper_state();
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();

        state.start_tracking_account(id).await.unwrap();

        assert_eq!(state.streams.status(id).await, TrackingStatus::Tracking);
        assert!(state.orders.is_tracked(id).await);
        assert!(state.positions.is_tracked(id).await);
        assert!(state.wallets.is_tracked(id).await);
        assert!(state.tickers.is_tracked(id).await);
        assert!(state.venue.is_connected(id));

        state.stop_tracking_account(id).await;
        assert!(!state.orders.is_tracked(id).await);
        assert!(!state.venue.is_connected(id));
        assert!(!state.exchange.is_initialized(id).await);
    }

    #[tokio::test]
    async fn test_pushes_reach_caches() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        let _tasks = state.spawn_background();
        state.start_tracking_account(id).await.unwrap();
        state.track_market(id, MARKET).await.unwrap();

        state
            .exchange
            .open_order(id, &crate::models::OrderRequest::market(MARKET, OrderSide::Buy, 1.0))
            .await
            .unwrap();
        state.venue.set_quote(MARKET, Some(100.0), Some(102.0));

        let st = &state;
        assert!(
            eventually(move || async move {
                st.positions.get_positions(id).await.map_or(false, |p| p.len() == 1)
            })
            .await
        );
        assert!(
            eventually(move || async move {
                st.tickers.get_price(id, MARKET).await.ok().flatten() == Some(101.0)
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_invalid_strategy_touches_nothing() {
        let state = paper_state();
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();

        let mut bad = options();
        bad.currency_mode = None;
        assert!(state.create_strategy(id, MARKET, &bad).await.is_err());
        assert!(state.venue.calls().is_empty());
    }

    #[tokio::test]
    async fn test_strategy_on_untracked_account_opens_nothing() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();

        let err = state.create_strategy(id, MARKET, &options()).await.unwrap_err();

        assert!(matches!(err, AppError::NotTracked { .. }));
        assert!(!state.streams.is_tracking(id).await);
        assert!(state.streams.subscriptions(id).await.is_empty());
        assert!(!state.venue.is_connected(id));
        assert!(state.venue.calls().is_empty());
        assert!(state.engine.list_strategies(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_ticker_load_takes_subscription_back() {
        let state = paper_state();
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        state.start_tracking_account(id).await.unwrap();
        state
            .venue
            .fail(id, "getTicker", crate::exchange::AdapterError::Transport("reset".into()));

        assert!(state.create_strategy(id, MARKET, &options()).await.is_err());

        assert!(!state.streams.subscriptions(id).await.contains(&Topic::ticker(MARKET)));
        assert!(state.tickers.tracked_markets(id).await.unwrap().is_empty());
        assert!(state.engine.list_strategies(None).await.is_empty());
        assert!(state.streams.is_tracking(id).await);
    }

    #[tokio::test]
    async fn test_untrack_market_refused_while_strategy_lives() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        state.start_tracking_account(id).await.unwrap();
        let strategy = state.create_strategy(id, MARKET, &options()).await.unwrap();

        let err = state.untrack_market(id, MARKET).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(state.streams.subscriptions(id).await.contains(&Topic::ticker(MARKET)));
        assert_eq!(state.tickers.tracked_markets(id).await.unwrap(), vec![MARKET.to_string()]);

        state.engine.remove_strategy(strategy.id).await.unwrap();
        state.untrack_market(id, MARKET).await.unwrap();
        assert!(!state.streams.subscriptions(id).await.contains(&Topic::ticker(MARKET)));
        assert!(state.tickers.tracked_markets(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credential_change_rebuilds_exchange_and_channel() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account.clone()).await.unwrap();
        state.start_tracking_account(id).await.unwrap();
        state.track_market(id, MARKET).await.unwrap();
        assert_eq!(state.venue.call_count(id, "initialize"), 1);
        assert_eq!(state.venue.call_count(id, "connect"), 1);

        let mut rotated = account;
        rotated.credentials.api_key = "a-rotated-key".into();
        let outcome = state.upsert_account(rotated).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated { credentials_changed: true });
        assert_eq!(state.venue.call_count(id, "clean"), 1);
        assert_eq!(state.venue.call_count(id, "initialize"), 2);
        assert_eq!(state.venue.call_count(id, "connect"), 2);
        assert!(state.exchange.is_initialized(id).await);
        assert!(state.venue.is_connected(id));
        assert!(state.streams.subscriptions(id).await.contains(&Topic::ticker(MARKET)));
    }

    #[tokio::test]
    async fn test_name_change_keeps_exchange() {
        let state = paper_state();
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account.clone()).await.unwrap();
        state.start_tracking_account(id).await.unwrap();

        let mut renamed = account;
        renamed.name = "renamed".into();
        let outcome = state.upsert_account(renamed).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated { credentials_changed: false });
        assert_eq!(state.venue.call_count(id, "clean"), 0);
        assert_eq!(state.venue.call_count(id, "initialize"), 1);
        assert_eq!(state.venue.call_count(id, "connect"), 1);
    }

    #[tokio::test]
    async fn test_strategy_reacts_to_pushed_fill() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        let _tasks = state.spawn_background();
        state.start_tracking_account(id).await.unwrap();

        let strategy = state.create_strategy(id, MARKET, &options()).await.unwrap();
        assert_eq!(strategy.cycles, 1);

        // the base market order filled at the ask (101); its pushed execution
        // moves the take-profit to 101 * 1.01
        let st = &state;
        let strategy_id = strategy.id;
        let take_profit = move || async move {
            let s = st.engine.get_strategy(strategy_id).await.ok()?;
            let tp_id = s.ledger.take_profit.clone()?;
            let tp = st.venue.orders(id).into_iter().find(|o| o.id == tp_id)?;
            (s.ledger.filled_quantity == 1.0).then_some(tp)
        };
        assert!(
            eventually(move || async move {
                take_profit()
                    .await
                    .is_some_and(|tp| (tp.price.unwrap_or_default() - 102.01).abs() < 1e-9)
            })
            .await
        );
        let tp = take_profit().await.unwrap();
        assert_eq!(tp.order_type, OrderType::Limit);
        assert_eq!(tp.side, OrderSide::Sell);
        assert!(tp.reduce_only);
    }
}
