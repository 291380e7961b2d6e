//! # cache::positions
//!
//! Open positions per account, keyed by (market, side).  Pushes upsert by key
//! and a size-zero push removes the position.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{sweep, Commit, Refreshable, TrackedMap};
use crate::error::{AppResult, SweepError};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeService;
use crate::models::{same_positions, AccountId, Position};

const COMPONENT: &str = "position cache";

fn sort(positions: &mut [Position]) {
    positions.sort_by(|a, b| a.key().cmp(&b.key()));
}

pub struct PositionCache {
    exchange: Arc<ExchangeService>,
    bus: EventBus,
    positions: TrackedMap<Vec<Position>>,
}

impl PositionCache {
    pub fn new(exchange: Arc<ExchangeService>, bus: EventBus) -> Self {
        Self {
            exchange,
            bus,
            positions: TrackedMap::new(COMPONENT),
        }
    }

    pub async fn start_tracking_account(&self, account_id: AccountId) -> AppResult<()> {
        if !self.positions.insert_if_absent(account_id, Vec::new()).await {
            warn!(account_id = %account_id, "Positions already tracked");
            return Ok(());
        }
        self.refresh_one(account_id).await
    }

    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        self.positions.remove(account_id).await;
    }

    pub async fn is_tracked(&self, account_id: AccountId) -> bool {
        self.positions.is_tracked(account_id).await
    }

    pub async fn refresh_one(&self, account_id: AccountId) -> AppResult<()> {
        self.positions.ensure_tracked(account_id).await?;
        let mut fetched = self.exchange.get_open_positions(account_id).await?;
        fetched.retain(|p| !p.is_flat());
        sort(&mut fetched);
        let (_, positions) = self
            .positions
            .update(account_id, |current| {
                if same_positions(current, &fetched) {
                    return false;
                }
                *current = fetched;
                true
            })
            .await;
        self.publish(account_id, positions);
        Ok(())
    }

    /// Merge pushed positions.  Fields a push leaves at zero (mark price,
    /// leverage) keep their last known value.
    pub async fn apply_push(&self, account_id: AccountId, pushed: &[Position]) -> Commit {
        let (commit, positions) = self
            .positions
            .update(account_id, |current| {
                let mut next = current.clone();
                for update in pushed {
                    let index = next.iter().position(|p| p.key() == update.key());
                    let previous = index.map(|i| next.remove(i));
                    if update.is_flat() {
                        continue;
                    }
                    let mut position = update.clone();
                    if let Some(previous) = previous {
                        if position.mark_price == 0.0 {
                            position.mark_price = previous.mark_price;
                        }
                        if position.leverage == 0.0 {
                            position.leverage = previous.leverage;
                        }
                    }
                    next.push(position);
                }
                sort(&mut next);
                if same_positions(current, &next) {
                    return false;
                }
                *current = next;
                true
            })
            .await;
        self.publish(account_id, positions);
        commit
    }

    fn publish(&self, account_id: AccountId, positions: Option<Vec<Position>>) {
        if let Some(positions) = positions {
            self.bus.emit(Event::PositionsUpdated {
                account_id,
                positions,
            });
        }
    }

    pub async fn get_positions(&self, account_id: AccountId) -> AppResult<Vec<Position>> {
        self.positions.get(account_id).await
    }
}

#[async_trait]
impl Refreshable for PositionCache {
    fn domain(&self) -> &'static str {
        "positions"
    }

    async fn refresh_all(&self) -> Result<(), SweepError> {
        let accounts = self.positions.tracked().await;
        sweep("positions", accounts, |id| self.refresh_one(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{OrderRequest, OrderSide};
    use crate::testkit::{drain_names, Harness};

    #[tokio::test]
    async fn test_refresh_picks_up_fill() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let id = h.add_account("a").await;
        let cache = PositionCache::new(h.exchange.clone(), h.bus.clone());
        cache.start_tracking_account(id).await.unwrap();
        let mut rx = h.bus.subscribe();

        h.exchange
            .open_order(id, &OrderRequest::market("BTCUSDT", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        cache.refresh_one(id).await.unwrap();
        cache.refresh_one(id).await.unwrap();

        let positions = cache.get_positions(id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, 101.0);
        assert_eq!(drain_names(&mut rx, "positions."), vec!["positions.updated"]);
    }

    #[tokio::test]
    async fn test_push_keeps_mark_and_removes_flat() {
        let h = Harness::new();
        h.venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let id = h.add_account("a").await;
        h.exchange
            .open_order(id, &OrderRequest::market("BTCUSDT", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        let cache = PositionCache::new(h.exchange.clone(), h.bus.clone());
        cache.start_tracking_account(id).await.unwrap();
        let current = cache.get_positions(id).await.unwrap().remove(0);

        let mut pushed = current.clone();
        pushed.size = 3.0;
        pushed.mark_price = 0.0;
        assert_eq!(cache.apply_push(id, &[pushed]).await, Commit::Changed);
        let after = cache.get_positions(id).await.unwrap();
        assert_eq!(after[0].size, 3.0);
        assert_eq!(after[0].mark_price, current.mark_price);

        let mut closed = current;
        closed.size = 0.0;
        cache.apply_push(id, &[closed]).await;
        assert!(cache.get_positions(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_read_fails() {
        let h = Harness::new();
        let id = h.add_account("a").await;
        let cache = PositionCache::new(h.exchange.clone(), h.bus.clone());
        assert!(matches!(cache.get_positions(id).await, Err(AppError::NotTracked { .. })));
        assert_eq!(cache.apply_push(id, &[]).await, Commit::Discarded);
    }
}
