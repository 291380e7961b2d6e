//! # cache::ticker
//!
//! Best bid/ask per (account, market).  An account is tracked as a whole and
//! then markets are added to it one by one; only tracked markets are polled
//! and only they accept pushes.
//!
//! `ticker.updated` carries the mid price, so it is published only when a
//! change leaves both sides present.  A one-sided quote still lands in the
//! snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::{sweep, Commit, Refreshable, TrackedMap};
use crate::error::{AppError, AppResult, SweepError};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeService;
use crate::models::{AccountId, Ticker};

const COMPONENT: &str = "ticker cache";

type Markets = BTreeMap<String, Ticker>;

pub struct TickerCache {
    exchange: Arc<ExchangeService>,
    bus: EventBus,
    tickers: TrackedMap<Markets>,
}

impl TickerCache {
    pub fn new(exchange: Arc<ExchangeService>, bus: EventBus) -> Self {
        Self {
            exchange,
            bus,
            tickers: TrackedMap::new(COMPONENT),
        }
    }

    pub async fn start_tracking_account(&self, account_id: AccountId) -> AppResult<()> {
        if !self.tickers.insert_if_absent(account_id, Markets::new()).await {
            warn!(account_id = %account_id, "Tickers already tracked");
            return Ok(());
        }
        self.refresh_one(account_id).await
    }

    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        self.tickers.remove(account_id).await;
    }

    pub async fn is_tracked(&self, account_id: AccountId) -> bool {
        self.tickers.is_tracked(account_id).await
    }

    /// Add `market` to the account's tracked set and fetch its first quote.
    /// Adding a market twice only refetches.
    pub async fn track_market(&self, account_id: AccountId, market: &str) -> AppResult<()> {
        let (commit, _) = self
            .tickers
            .update(account_id, |markets| {
                if markets.contains_key(market) {
                    return false;
                }
                markets.insert(market.to_string(), Ticker::empty(market));
                true
            })
            .await;
        if commit == Commit::Discarded {
            return Err(AppError::not_tracked(COMPONENT, account_id));
        }
        self.refresh_market(account_id, market).await.map(|_| ())
    }

    pub async fn untrack_market(&self, account_id: AccountId, market: &str) -> AppResult<()> {
        self.tickers.ensure_tracked(account_id).await?;
        self.tickers
            .update(account_id, |markets| markets.remove(market).is_some())
            .await;
        Ok(())
    }

    pub async fn tracked_markets(&self, account_id: AccountId) -> AppResult<Vec<String>> {
        Ok(self.tickers.get(account_id).await?.into_keys().collect())
    }

    /// Poll every tracked market of the account concurrently.  Markets that
    /// answered are committed even when others failed; the first failure is
    /// returned.
    pub async fn refresh_one(&self, account_id: AccountId) -> AppResult<()> {
        let markets = self.tracked_markets(account_id).await?;
        let results = join_all(
            markets
                .iter()
                .map(|market| self.refresh_market(account_id, market)),
        )
        .await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    async fn refresh_market(&self, account_id: AccountId, market: &str) -> AppResult<Commit> {
        let fetched = self.exchange.get_ticker(account_id, market).await?;
        Ok(self
            .write(account_id, market, |ticker| {
                if ticker.same_quote(&fetched) {
                    return false;
                }
                ticker.bid = fetched.bid;
                ticker.ask = fetched.ask;
                ticker.updated_at = Utc::now();
                true
            })
            .await)
    }

    /// Merge a pushed quote; sides the push leaves out keep their value.
    pub async fn apply_push(
        &self,
        account_id: AccountId,
        market: &str,
        bid: Option<f64>,
        ask: Option<f64>,
    ) -> Commit {
        self.write(account_id, market, |ticker| ticker.merge(bid, ask))
            .await
    }

    async fn write<F>(&self, account_id: AccountId, market: &str, apply: F) -> Commit
    where
        F: FnOnce(&mut Ticker) -> bool,
    {
        let mut missing = false;
        let mut changed = None;
        let (commit, _) = self
            .tickers
            .update(account_id, |markets| {
                let Some(ticker) = markets.get_mut(market) else {
                    missing = true;
                    return false;
                };
                if !apply(ticker) {
                    return false;
                }
                changed = Some(ticker.clone());
                true
            })
            .await;
        if missing {
            debug!(account_id = %account_id, market, "Quote for untracked market discarded");
            return Commit::Discarded;
        }
        if let Some(ticker) = changed {
            match ticker.price() {
                Some(price) => self.bus.emit(Event::TickerUpdated {
                    account_id,
                    ticker,
                    price,
                }),
                None => debug!(account_id = %account_id, market, "One-sided quote, price not published"),
            }
        }
        commit
    }

    pub async fn get_ticker(&self, account_id: AccountId, market: &str) -> AppResult<Ticker> {
        self.tickers
            .get(account_id)
            .await?
            .remove(market)
            .ok_or_else(|| AppError::MarketNotTracked {
                account_id,
                market: market.to_string(),
            })
    }

    /// Mid price, `None` while a side is missing.
    pub async fn get_price(&self, account_id: AccountId, market: &str) -> AppResult<Option<f64>> {
        Ok(self.get_ticker(account_id, market).await?.price())
    }

    pub async fn get_tickers(&self, account_id: AccountId) -> AppResult<Vec<Ticker>> {
        Ok(self.tickers.get(account_id).await?.into_values().collect())
    }
}

#[async_trait]
impl Refreshable for TickerCache {
    fn domain(&self) -> &'static str {
        "ticker"
    }

    async fn refresh_all(&self) -> Result<(), SweepError> {
        let accounts = self.tickers.tracked().await;
        sweep("ticker", accounts, |id| self.refresh_one(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::AdapterError;
    use crate::testkit::{drain, drain_names, Harness};

    async fn tracked(h: &Harness, name: &str) -> (TickerCache, AccountId) {
        let id = h.add_account(name).await;
        let cache = TickerCache::new(h.exchange.clone(), h.bus.clone());
        cache.start_tracking_account(id).await.unwrap();
        (cache, id)
    }

    #[tokio::test]
    async fn test_midpoint_is_published() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", None, None);
        let (cache, id) = tracked(&h, "a").await;
        cache.track_market(id, "BTCUSDT").await.unwrap();
        let mut rx = h.bus.subscribe();

        assert_eq!(cache.apply_push(id, "BTCUSDT", Some(10.0), Some(12.0)).await, Commit::Changed);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::TickerUpdated { price, ticker, .. } => {
                assert_eq!(*price, 11.0);
                assert_eq!(ticker.market, "BTCUSDT");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(cache.get_price(id, "BTCUSDT").await.unwrap(), Some(11.0));
    }

    #[tokio::test]
    async fn test_one_sided_quote_updates_without_event() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", None, None);
        let (cache, id) = tracked(&h, "a").await;
        cache.track_market(id, "BTCUSDT").await.unwrap();
        let mut rx = h.bus.subscribe();

        assert_eq!(cache.apply_push(id, "BTCUSDT", Some(10.0), None).await, Commit::Changed);
        assert!(drain_names(&mut rx, "ticker.").is_empty());

        let ticker = cache.get_ticker(id, "BTCUSDT").await.unwrap();
        assert_eq!(ticker.bid, Some(10.0));
        assert_eq!(cache.get_price(id, "BTCUSDT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unchanged_quote_is_suppressed() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let (cache, id) = tracked(&h, "a").await;
        let mut rx = h.bus.subscribe();

        cache.track_market(id, "BTCUSDT").await.unwrap();
        cache.refresh_one(id).await.unwrap();
        assert_eq!(cache.apply_push(id, "BTCUSDT", Some(99.0), None).await, Commit::Unchanged);

        assert_eq!(drain_names(&mut rx, "ticker."), vec!["ticker.updated"]);
    }

    #[tokio::test]
    async fn test_untracked_market_push_is_discarded() {
        let h = Harness::new();
        let (cache, id) = tracked(&h, "a").await;
        assert_eq!(cache.apply_push(id, "ETHUSDT", Some(1.0), Some(2.0)).await, Commit::Discarded);
        assert!(matches!(
            cache.get_ticker(id, "ETHUSDT").await,
            Err(AppError::MarketNotTracked { .. })
        ));
    }

    #[tokio::test]
    async fn test_track_market_requires_tracked_account() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        let cache = TickerCache::new(h.exchange.clone(), h.bus.clone());
        assert!(matches!(
            cache.track_market(id, "BTCUSDT").await,
            Err(AppError::NotTracked { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_reports_failing_account_only() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let (cache, x) = tracked(&h, "x").await;
        let y = h.add_account("y").await;
        cache.start_tracking_account(y).await.unwrap();
        cache.track_market(x, "BTCUSDT").await.unwrap();
        cache.track_market(y, "BTCUSDT").await.unwrap();

        h.venue.fail(x, "getTicker", AdapterError::Transport("reset".into()));
        h.venue.set_quote("BTCUSDT", Some(100.0), Some(102.0));

        let err = cache.refresh_all().await.unwrap_err();
        assert_eq!(err.accounts(), vec![x]);
        assert_eq!(cache.get_price(y, "BTCUSDT").await.unwrap(), Some(101.0));
        assert_eq!(cache.get_price(x, "BTCUSDT").await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_untrack_market_drops_snapshot() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let (cache, id) = tracked(&h, "a").await;
        cache.track_market(id, "BTCUSDT").await.unwrap();
        cache.untrack_market(id, "BTCUSDT").await.unwrap();

        assert!(cache.get_tickers(id).await.unwrap().is_empty());
        cache.stop_tracking_account(id).await;
        assert!(matches!(cache.get_tickers(id).await, Err(AppError::NotTracked { .. })));
    }
}
