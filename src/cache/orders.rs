//! # cache::orders
//!
//! Open orders per account.  Polled through `getOpenOrders`; order pushes
//! upsert by id and drop orders that are no longer open.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{sweep, Commit, Refreshable, TrackedMap};
use crate::error::{AppResult, SweepError};
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeService;
use crate::models::{same_orders, AccountId, Order};

const COMPONENT: &str = "order cache";

pub struct OrderCache {
    exchange: Arc<ExchangeService>,
    bus: EventBus,
    orders: TrackedMap<Vec<Order>>,
}

impl OrderCache {
    pub fn new(exchange: Arc<ExchangeService>, bus: EventBus) -> Self {
        Self {
            exchange,
            bus,
            orders: TrackedMap::new(COMPONENT),
        }
    }

    pub async fn start_tracking_account(&self, account_id: AccountId) -> AppResult<()> {
        if !self.orders.insert_if_absent(account_id, Vec::new()).await {
            warn!(account_id = %account_id, "Orders already tracked");
            return Ok(());
        }
        self.refresh_one(account_id).await
    }

    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        self.orders.remove(account_id).await;
    }

    pub async fn is_tracked(&self, account_id: AccountId) -> bool {
        self.orders.is_tracked(account_id).await
    }

    pub async fn refresh_one(&self, account_id: AccountId) -> AppResult<()> {
        self.orders.ensure_tracked(account_id).await?;
        let fetched = self.exchange.get_open_orders(account_id, None).await?;
        self.commit(account_id, fetched).await;
        Ok(())
    }

    /// Replace the snapshot if it differs and publish `orders.updated`.
    async fn commit(&self, account_id: AccountId, mut fetched: Vec<Order>) -> Commit {
        fetched.sort_by(|a, b| a.id.cmp(&b.id));
        let (commit, orders) = self
            .orders
            .update(account_id, |current| {
                if same_orders(current, &fetched) {
                    return false;
                }
                *current = fetched;
                true
            })
            .await;
        self.publish(account_id, orders);
        commit
    }

    /// Merge pushed orders: open ones are upserted, closed ones removed.
    pub async fn apply_push(&self, account_id: AccountId, pushed: &[Order]) -> Commit {
        let (commit, orders) = self
            .orders
            .update(account_id, |current| {
                let mut next = current.clone();
                for order in pushed {
                    next.retain(|o| o.id != order.id);
                    if order.status.is_open() {
                        next.push(order.clone());
                    }
                }
                next.sort_by(|a, b| a.id.cmp(&b.id));
                if same_orders(current, &next) {
                    return false;
                }
                *current = next;
                true
            })
            .await;
        self.publish(account_id, orders);
        commit
    }

    fn publish(&self, account_id: AccountId, orders: Option<Vec<Order>>) {
        if let Some(orders) = orders {
            self.bus.emit(Event::OrdersUpdated { account_id, orders });
        }
    }

    pub async fn get_orders(&self, account_id: AccountId) -> AppResult<Vec<Order>> {
        self.orders.get(account_id).await
    }

    pub async fn get_orders_for_market(&self, account_id: AccountId, market: &str) -> AppResult<Vec<Order>> {
        let mut orders = self.get_orders(account_id).await?;
        orders.retain(|o| o.market == market);
        Ok(orders)
    }
}

#[async_trait]
impl Refreshable for OrderCache {
    fn domain(&self) -> &'static str {
        "orders"
    }

    async fn refresh_all(&self) -> Result<(), SweepError> {
        let accounts = self.orders.tracked().await;
        sweep("orders", accounts, |id| self.refresh_one(id)).await
    }
}
