//! # cache::wallet
//!
//! Latest wallet per account.  A tracked account starts with an empty wallet
//! until the first balance fetch lands.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{sweep, Commit, Refreshable, TrackedMap};
use crate::error::{AppResult, SweepError};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeService;
use crate::models::{AccountId, Wallet};

const COMPONENT: &str = "wallet cache";

pub struct WalletCache {
    exchange: Arc<ExchangeService>,
    bus: EventBus,
    wallets: TrackedMap<Wallet>,
}

impl WalletCache {
    pub fn new(exchange: Arc<ExchangeService>, bus: EventBus) -> Self {
        Self {
            exchange,
            bus,
            wallets: TrackedMap::new(COMPONENT),
        }
    }

    pub async fn start_tracking_account(&self, account_id: AccountId) -> AppResult<()> {
        if !self.wallets.insert_if_absent(account_id, Wallet::empty()).await {
            warn!(account_id = %account_id, "Wallet already tracked");
            return Ok(());
        }
        self.refresh_one(account_id).await
    }

    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        self.wallets.remove(account_id).await;
    }

    pub async fn is_tracked(&self, account_id: AccountId) -> bool {
        self.wallets.is_tracked(account_id).await
    }

    pub async fn refresh_one(&self, account_id: AccountId) -> AppResult<()> {
        self.wallets.ensure_tracked(account_id).await?;
        let fetched = self.exchange.get_balances(account_id).await?;
        let (_, wallet) = self
            .wallets
            .update(account_id, |current| {
                if current.same_balances(&fetched) {
                    return false;
                }
                *current = fetched;
                true
            })
            .await;
        self.publish(account_id, wallet);
        Ok(())
    }

    /// Overlay a pushed wallet: currencies it names are replaced, the rest kept.
    pub async fn apply_push(&self, account_id: AccountId, pushed: &Wallet) -> Commit {
        let (commit, wallet) = self
            .wallets
            .update(account_id, |current| {
                let mut next = current.clone();
                next.merge(pushed);
                if current.same_balances(&next) {
                    return false;
                }
                *current = next;
                true
            })
            .await;
        self.publish(account_id, wallet);
        commit
    }

    fn publish(&self, account_id: AccountId, wallet: Option<Wallet>) {
        if let Some(wallet) = wallet {
            self.bus.emit(Event::WalletUpdated {
                account_id,
                wallet: Box::new(wallet),
            });
        }
    }

    pub async fn get_wallet(&self, account_id: AccountId) -> AppResult<Wallet> {
        self.wallets.get(account_id).await
    }
}

#[async_trait]
impl Refreshable for WalletCache {
    fn domain(&self) -> &'static str {
        "wallet"
    }

    async fn refresh_all(&self) -> Result<(), SweepError> {
        let accounts = self.wallets.tracked().await;
        sweep("wallet", accounts, |id| self.refresh_one(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::exchange::paper::PAPER_STARTING_BALANCE;
    use crate::models::{Balance, DEFAULT_QUOTE_CURRENCY};
    use crate::testkit::{drain_names, Harness};

    #[tokio::test]
    async fn test_start_loads_balances_once() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        let cache = WalletCache::new(h.exchange.clone(), h.bus.clone());
        let mut rx = h.bus.subscribe();

        cache.start_tracking_account(id).await.unwrap();
        cache.refresh_one(id).await.unwrap();

        let wallet = cache.get_wallet(id).await.unwrap();
        assert_eq!(wallet.equity, PAPER_STARTING_BALANCE);
        assert_eq!(drain_names(&mut rx, "wallet."), vec!["wallet.updated"]);
    }

    #[tokio::test]
    async fn test_push_overlays_currencies() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        let cache = WalletCache::new(h.exchange.clone(), h.bus.clone());
        cache.start_tracking_account(id).await.unwrap();

        let mut pushed = Wallet::empty();
        pushed.equity = 10_500.0;
        pushed.balances.insert(
            "BTC".into(),
            Balance {
                free: 0.1,
                used: 0.0,
                total: 0.1,
                debt: 0.0,
            },
        );
        assert_eq!(cache.apply_push(id, &pushed).await, Commit::Changed);
        assert_eq!(cache.apply_push(id, &pushed).await, Commit::Unchanged);

        let wallet = cache.get_wallet(id).await.unwrap();
        assert_eq!(wallet.equity, 10_500.0);
        assert!(wallet.balances.contains_key("BTC"));
        assert!(wallet.balances.contains_key(DEFAULT_QUOTE_CURRENCY));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_account_tracked() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        h.venue.fail(id, "getBalances", crate::exchange::AdapterError::Transport("down".into()));
        let cache = WalletCache::new(h.exchange.clone(), h.bus.clone());

        assert!(cache.start_tracking_account(id).await.is_err());
        assert!(cache.is_tracked(id).await);
        assert_eq!(cache.get_wallet(id).await.unwrap().equity, 0.0);

        cache.stop_tracking_account(id).await;
        assert!(matches!(cache.get_wallet(id).await, Err(AppError::NotTracked { .. })));
    }
}
