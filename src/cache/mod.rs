//! # cache — tracking caches
//!
//! One cache per domain (ticker, orders, positions, wallet).  Each holds the
//! latest snapshot per tracked account, refreshes it from the exchange
//! service, merges pushes, and publishes an `…Updated` event only when the
//! snapshot really changed.
//!
//! "Tracked" is explicit: an account with an empty snapshot is tracked, an
//! account without an entry is not, and every read on it fails `NotTracked`.
//!
//! A refresh that completes after `stop_tracking_account` is discarded: the
//! write re-checks the tracked marker under the map's write lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, SweepError};
use crate::models::AccountId;

pub mod orders;
pub mod positions;
pub mod ticker;
pub mod wallet;

pub use orders::OrderCache;
pub use positions::PositionCache;
pub use ticker::TickerCache;
pub use wallet::WalletCache;

/// Outcome of writing a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Changed,
    Unchanged,
    /// The account stopped being tracked while the refresh was in flight.
    Discarded,
}

// ─── TrackedMap ───────────────────────────────────────────────────────────────

/// Account id → snapshot, where presence is the tracked marker.
pub(crate) struct TrackedMap<S> {
    component: &'static str,
    entries: RwLock<HashMap<AccountId, S>>,
}

impl<S: Clone> TrackedMap<S> {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `false` if the account was already tracked.
    pub async fn insert_if_absent(&self, account_id: AccountId, fresh: S) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&account_id) {
            return false;
        }
        entries.insert(account_id, fresh);
        true
    }

    pub async fn remove(&self, account_id: AccountId) -> bool {
        self.entries.write().await.remove(&account_id).is_some()
    }

    pub async fn is_tracked(&self, account_id: AccountId) -> bool {
        self.entries.read().await.contains_key(&account_id)
    }

    pub async fn tracked(&self) -> Vec<AccountId> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn get(&self, account_id: AccountId) -> AppResult<S> {
        self.entries
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or_else(|| AppError::not_tracked(self.component, account_id))
    }

    pub async fn ensure_tracked(&self, account_id: AccountId) -> AppResult<()> {
        if self.is_tracked(account_id).await {
            Ok(())
        } else {
            Err(AppError::not_tracked(self.component, account_id))
        }
    }

    /// Mutate the snapshot in place under the write lock.  `apply` returns
    /// whether it changed anything; the new snapshot is handed back on change.
    pub async fn update<F>(&self, account_id: AccountId, apply: F) -> (Commit, Option<S>)
    where
        F: FnOnce(&mut S) -> bool,
    {
        let mut entries = self.entries.write().await;
        let Some(snapshot) = entries.get_mut(&account_id) else {
            debug!(account_id = %account_id, component = self.component, "Update for untracked account discarded");
            return (Commit::Discarded, None);
        };
        if apply(snapshot) {
            (Commit::Changed, Some(snapshot.clone()))
        } else {
            (Commit::Unchanged, None)
        }
    }
}

// ─── Sweeps ───────────────────────────────────────────────────────────────────

/// Run `refresh` for every account concurrently and collect the failures.
pub(crate) async fn sweep<F, Fut>(
    domain: &'static str,
    accounts: Vec<AccountId>,
    refresh: F,
) -> Result<(), SweepError>
where
    F: Fn(AccountId) -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let results = join_all(accounts.into_iter().map(|account_id| {
        let pending = refresh(account_id);
        async move { (account_id, pending.await) }
    }))
    .await;

    let failures: Vec<(AccountId, AppError)> = results
        .into_iter()
        .filter_map(|(account_id, result)| result.err().map(|err| (account_id, err)))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(SweepError { domain, failures })
    }
}

/// The part of a cache the periodic refresher needs.
#[async_trait]
pub trait Refreshable: Send + Sync {
    fn domain(&self) -> &'static str;

    async fn refresh_all(&self) -> Result<(), SweepError>;
}

/// Call `refresh_all` every `every`, logging aggregated failures.  Each cache
/// gets its own loop and cadence.
pub fn spawn_refresh_loop(cache: Arc<dyn Refreshable>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = cache.refresh_all().await {
                warn!(domain = cache.domain(), failed = err.failures.len(), error = %err, "⚠️ Refresh sweep had failures");
            }
        }
    })
}
