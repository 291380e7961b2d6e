//! # exchange::service
//!
//! Owns the single live adapter per account.
//!
//! Adapters are created lazily on first use through the [`ExchangeFactory`],
//! torn down with [`ExchangeService::terminate`] and rebuilt (teardown first)
//! with [`ExchangeService::recreate`] when credentials change.  Creation is
//! serialised per account only: each account has its own slot lock, so a slow
//! handshake on one exchange never holds up another account.
//!
//! [`ExchangeService::terminate`] also retires the account: until
//! [`ExchangeService::initialize`] runs again, calls fail `NotTracked`
//! instead of lazily building a new adapter behind a finished teardown.
//!
//! Every adapter call goes through [`ExchangeService::call`], which maps
//! authentication failures to `InvalidCredentials` and everything else to
//! `OperationFailed(operation, cause)`, logging each failure once.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use super::factory::{AdapterHandle, ExchangeFactory};
use super::{AdapterError, AdapterResult};
use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::models::{
    AccountId, Market, Order, OrderRequest, OrderSide, OrderUpdate, Position, Ticker, Wallet,
};
use crate::registry::AccountRegistry;

type Slot = Arc<tokio::sync::Mutex<Option<AdapterHandle>>>;

pub struct ExchangeService {
    factory: ExchangeFactory,
    registry: Arc<dyn AccountRegistry>,
    bus: EventBus,
    slots: Mutex<HashMap<AccountId, Slot>>,
    /// Accounts torn down by `terminate` and not initialised since.
    retired: Mutex<HashSet<AccountId>>,
}

impl ExchangeService {
    pub fn new(factory: ExchangeFactory, registry: Arc<dyn AccountRegistry>, bus: EventBus) -> Self {
        Self {
            factory,
            registry,
            bus,
            slots: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
        }
    }

    fn slot(&self, account_id: AccountId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(account_id).or_default().clone()
    }

    fn is_retired(&self, account_id: AccountId) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&account_id)
    }

    /// Lift a previous `terminate` and make sure an adapter is live.
    pub async fn initialize(&self, account_id: AccountId) -> AppResult<AdapterHandle> {
        self.retired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&account_id);
        self.exchange(account_id).await
    }

    /// The live adapter for `account_id`, created on first use.  Fails
    /// `NotTracked` after `terminate` until `initialize` is called.
    pub async fn exchange(&self, account_id: AccountId) -> AppResult<AdapterHandle> {
        let slot = self.slot(account_id);
        let mut guard = slot.lock().await;
        if let Some(adapter) = guard.as_ref() {
            return Ok(adapter.clone());
        }
        if self.is_retired(account_id) {
            return Err(AppError::not_tracked("exchange service", account_id));
        }
        let adapter = self.create(account_id).await?;
        *guard = Some(adapter.clone());
        Ok(adapter)
    }

    pub async fn is_initialized(&self, account_id: AccountId) -> bool {
        let slot = self.slot(account_id);
        let guard = slot.lock().await;
        guard.is_some()
    }

    async fn create(&self, account_id: AccountId) -> AppResult<AdapterHandle> {
        let account = self.registry.get_account_by_id(account_id).await?;
        let adapter = self.factory.create_exchange(&account).await?;
        self.bus.emit(Event::ExchangeInitialized { account_id });
        Ok(adapter)
    }

    /// Tear down the current adapter (if any) and build a fresh one from the
    /// registry's current account record.
    pub async fn recreate(&self, account_id: AccountId) -> AppResult<AdapterHandle> {
        let slot = self.slot(account_id);
        let mut guard = slot.lock().await;
        if let Some(old) = guard.take() {
            self.release(account_id, old).await;
        }
        let adapter = self.create(account_id).await?;
        *guard = Some(adapter.clone());
        info!(account_id = %account_id, "♻️ Exchange adapter recreated");
        Ok(adapter)
    }

    /// Drop the adapter for `account_id` and retire the account.  No adapter
    /// call in flight can bring it back; only `initialize` does.
    pub async fn terminate(&self, account_id: AccountId) {
        let slot = self.slot(account_id);
        let mut guard = slot.lock().await;
        self.retired
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(account_id);
        if let Some(old) = guard.take() {
            self.release(account_id, old).await;
        }
        drop(guard);
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&account_id);
    }

    async fn release(&self, account_id: AccountId, adapter: AdapterHandle) {
        if let Err(err) = adapter.clean().await {
            warn!(account_id = %account_id, error = %err, "Adapter clean-up failed");
        }
        self.bus.emit(Event::ExchangeTerminated { account_id });
        info!(account_id = %account_id, "🔌 Exchange adapter terminated");
    }

    /// Run one adapter operation with the standard error wrapping.
    pub async fn call<T, F, Fut>(&self, account_id: AccountId, operation: &'static str, f: F) -> AppResult<T>
    where
        F: FnOnce(AdapterHandle) -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let adapter = self.exchange(account_id).await?;
        f(adapter).await.map_err(|err| {
            error!(account_id = %account_id, operation, error = %err, "❌ Exchange call failed");
            wrap(operation, err)
        })
    }

    // ── Wrapped operations ──────────────────────────────────────────────────

    pub async fn get_balances(&self, account_id: AccountId) -> AppResult<Wallet> {
        self.call(account_id, "getBalances", |a| async move { a.get_balances().await })
            .await
    }

    pub async fn get_markets(&self, account_id: AccountId) -> AppResult<Vec<Market>> {
        self.call(account_id, "getMarkets", |a| async move { a.get_markets().await })
            .await
    }

    pub async fn get_ticker(&self, account_id: AccountId, market: &str) -> AppResult<Ticker> {
        self.call(account_id, "getTicker", |a| async move { a.get_ticker(market).await })
            .await
    }

    pub async fn get_open_orders(&self, account_id: AccountId, market: Option<&str>) -> AppResult<Vec<Order>> {
        self.call(account_id, "getOpenOrders", |a| async move {
            a.get_open_orders(market).await
        })
        .await
    }

    pub async fn get_orders(&self, account_id: AccountId, market: Option<&str>) -> AppResult<Vec<Order>> {
        self.call(account_id, "getOrders", |a| async move { a.get_orders(market).await })
            .await
    }

    pub async fn get_order(&self, account_id: AccountId, id: &str, market: &str) -> AppResult<Order> {
        self.call(account_id, "getOrder", |a| async move { a.get_order(id, market).await })
            .await
    }

    pub async fn get_open_positions(&self, account_id: AccountId) -> AppResult<Vec<Position>> {
        self.call(account_id, "getOpenPositions", |a| async move {
            a.get_open_positions().await
        })
        .await
    }

    pub async fn open_order(&self, account_id: AccountId, request: &OrderRequest) -> AppResult<Order> {
        self.call(account_id, "openOrder", |a| async move { a.open_order(request).await })
            .await
    }

    pub async fn update_order(&self, account_id: AccountId, update: &OrderUpdate) -> AppResult<Order> {
        self.call(account_id, "updateOrder", |a| async move { a.update_order(update).await })
            .await
    }

    pub async fn cancel_order(&self, account_id: AccountId, id: &str, market: &str) -> AppResult<()> {
        self.call(account_id, "cancelOrder", |a| async move {
            a.cancel_order(id, market).await
        })
        .await
    }

    pub async fn cancel_orders(&self, account_id: AccountId, market: &str) -> AppResult<()> {
        self.call(account_id, "cancelOrders", |a| async move { a.cancel_orders(market).await })
            .await
    }

    pub async fn close_position(&self, account_id: AccountId, market: &str, side: OrderSide) -> AppResult<Order> {
        self.call(account_id, "closePosition", |a| async move {
            a.close_position(market, side).await
        })
        .await
    }
}

fn wrap(operation: &'static str, err: AdapterError) -> AppError {
    match err {
        AdapterError::Authentication(msg) => AppError::InvalidCredentials(msg),
        other => AppError::operation(operation, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{PaperExchange, PaperVenue};
    use crate::models::{Account, Credentials, ExchangeKind};
    use crate::registry::InMemoryAccountRegistry;

    struct Fixture {
        venue: Arc<PaperVenue>,
        registry: Arc<InMemoryAccountRegistry>,
        service: Arc<ExchangeService>,
        bus: EventBus,
        account: Account,
    }

    async fn fixture() -> Fixture {
        let venue = PaperVenue::new();
        venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let account = Account::new(
            "paper",
            ExchangeKind::Paper,
            Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                testnet: true,
            },
        );
        let registry = Arc::new(InMemoryAccountRegistry::with_accounts([account.clone()]));
        let mut factory = ExchangeFactory::empty();
        let v = venue.clone();
        factory.register(ExchangeKind::Paper, move |acc| {
            Ok(Arc::new(PaperExchange::new(acc.id, acc.credentials.api_key.clone(), v.clone()))
                as AdapterHandle)
        });
        let bus = EventBus::new(64);
        let service = Arc::new(ExchangeService::new(factory, registry.clone(), bus.clone()));
        Fixture {
            venue,
            registry,
            service,
            bus,
            account,
        }
    }

    #[tokio::test]
    async fn test_adapter_is_created_once() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe();
        let id = f.account.id;

        let (a, b) = tokio::join!(f.service.get_open_orders(id, None), f.service.get_balances(id));
        a.unwrap();
        b.unwrap();

        assert_eq!(f.venue.call_count(id, "initialize"), 1);
        assert_eq!(rx.recv().await.unwrap().name(), "exchange.initialized");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_with_operation_name() {
        let f = fixture().await;
        let id = f.account.id;
        f.venue.fail(id, "cancelOrder", AdapterError::Exchange("order not found".into()));
        let err = f.service.cancel_order(id, "nope", "BTCUSDT").await.unwrap_err();
        assert_eq!(err.to_string(), "cancelOrder failed: exchange error: order not found");
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_as_invalid_credentials() {
        let f = fixture().await;
        let id = f.account.id;
        f.venue.fail(id, "getBalances", AdapterError::Authentication("key revoked".into()));
        let err = f.service.get_balances(id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials(_)));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let f = fixture().await;
        let err = f.service.get_balances(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_recreate_tears_down_first() {
        let f = fixture().await;
        let id = f.account.id;
        f.service.exchange(id).await.unwrap();

        let mut updated = f.account.clone();
        updated.credentials.api_key = "rotated".into();
        f.registry.upsert(updated).await;

        let mut rx = f.bus.subscribe();
        f.service.recreate(id).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().name(), "exchange.terminated");
        assert_eq!(rx.recv().await.unwrap().name(), "exchange.initialized");
        assert_eq!(f.venue.call_count(id, "clean"), 1);
        assert_eq!(f.venue.call_count(id, "initialize"), 2);
    }

    #[tokio::test]
    async fn test_terminate_is_noop_when_idle() {
        let f = fixture().await;
        let id = f.account.id;
        f.service.terminate(id).await;
        assert_eq!(f.venue.call_count(id, "clean"), 0);

        f.service.initialize(id).await.unwrap();
        f.service.terminate(id).await;
        assert!(!f.service.is_initialized(id).await);
        assert_eq!(f.venue.call_count(id, "clean"), 1);
    }

    #[tokio::test]
    async fn test_calls_after_terminate_do_not_revive_adapter() {
        let f = fixture().await;
        let id = f.account.id;
        f.service.initialize(id).await.unwrap();
        f.service.terminate(id).await;
        let mut rx = f.bus.subscribe();

        // a refresh that was already past its tracking check
        let err = f.service.get_open_orders(id, None).await.unwrap_err();
        assert!(matches!(err, AppError::NotTracked { account_id, .. } if account_id == id));
        assert!(!f.service.is_initialized(id).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.venue.call_count(id, "initialize"), 1);

        f.service.initialize(id).await.unwrap();
        f.service.get_open_orders(id, None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().name(), "exchange.initialized");
        assert_eq!(f.venue.call_count(id, "initialize"), 2);
    }
}
