//! # stream::manager
//!
//! Owns one push connection per tracked account and its subscription set.
//!
//! Per-account lifecycle:
//!
//! ```text
//!   Untracked ──start──▶ Connecting ──ok──▶ Tracking ──stop──▶ Untracked
//!                            │ err                │ socket lost
//!                            ▼                    ▼
//!                        Untracked          Reconnecting ──ok──▶ Tracking (whole set resubscribed)
//!                                                 │ attempts exhausted / stop
//!                                                 ▼
//!                                             Untracked
//! ```
//!
//! All mutations of one account's entry happen under that entry's lock, so
//! start/subscribe/unsubscribe/stop for the same account never interleave.
//! Each stop or successful start bumps `generation`; a handler task that
//! finds a newer generation exits instead of reconnecting.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::binance::BinanceConnector;
use super::bybit::BybitConnector;
use super::paper::PaperConnector;
use super::{Connection, PushChannel, PushConnector, RawMessage, StreamEvent, Topic};
use crate::config::{ExchangeEndpoints, ReconnectConfig};
use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::exchange::paper::PaperVenue;
use crate::models::{Account, AccountId, ExchangeKind};
use crate::registry::AccountRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Untracked,
    Connecting,
    Tracking,
    Reconnecting,
}

struct StreamState {
    status: TrackingStatus,
    generation: u64,
    channel: Option<Box<dyn PushChannel>>,
    subscribed: BTreeSet<Topic>,
    handler: Option<JoinHandle<()>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            status: TrackingStatus::Untracked,
            generation: 0,
            channel: None,
            subscribed: BTreeSet::new(),
            handler: None,
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.status = TrackingStatus::Untracked;
        self.channel = None;
        self.subscribed.clear();
    }
}

struct AccountStream {
    state: tokio::sync::Mutex<StreamState>,
}

pub struct StreamManager {
    connectors: HashMap<ExchangeKind, Arc<dyn PushConnector>>,
    registry: Arc<dyn AccountRegistry>,
    bus: EventBus,
    reconnect: ReconnectConfig,
    accounts: Mutex<HashMap<AccountId, Arc<AccountStream>>>,
}

impl StreamManager {
    pub fn new(registry: Arc<dyn AccountRegistry>, bus: EventBus, reconnect: ReconnectConfig) -> Self {
        Self {
            connectors: HashMap::new(),
            registry,
            bus,
            reconnect,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Bybit, Binance and paper connectors.
    pub fn standard(
        endpoints: &ExchangeEndpoints,
        venue: Arc<PaperVenue>,
        registry: Arc<dyn AccountRegistry>,
        bus: EventBus,
        reconnect: ReconnectConfig,
    ) -> Self {
        let mut manager = Self::new(registry, bus, reconnect);
        manager
            .register(Arc::new(BybitConnector::new(endpoints.bybit.clone())))
            .register(Arc::new(BinanceConnector::new(endpoints.binance.clone())))
            .register(Arc::new(PaperConnector::new(venue)));
        manager
    }

    pub fn register(&mut self, connector: Arc<dyn PushConnector>) -> &mut Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    fn entry(&self, account_id: AccountId) -> Arc<AccountStream> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        accounts
            .entry(account_id)
            .or_insert_with(|| {
                Arc::new(AccountStream {
                    state: tokio::sync::Mutex::new(StreamState::new()),
                })
            })
            .clone()
    }

    fn existing(&self, account_id: AccountId) -> Option<Arc<AccountStream>> {
        let accounts = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        accounts.get(&account_id).cloned()
    }

    fn is_current(&self, account_id: AccountId, entry: &Arc<AccountStream>) -> bool {
        self.existing(account_id)
            .is_some_and(|current| Arc::ptr_eq(&current, entry))
    }

    /// Drop `entry` from the map unless it was already replaced.  Callers hold
    /// the entry's lock.
    fn forget(&self, account_id: AccountId, entry: &Arc<AccountStream>) {
        let mut accounts = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        if accounts.get(&account_id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            accounts.remove(&account_id);
        }
    }

    fn connector(&self, kind: ExchangeKind) -> AppResult<Arc<dyn PushConnector>> {
        self.connectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::UnsupportedExchange(kind.to_string()))
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn status(&self, account_id: AccountId) -> TrackingStatus {
        match self.existing(account_id) {
            Some(entry) => entry.state.lock().await.status,
            None => TrackingStatus::Untracked,
        }
    }

    pub async fn is_tracking(&self, account_id: AccountId) -> bool {
        self.status(account_id).await == TrackingStatus::Tracking
    }

    pub async fn subscriptions(&self, account_id: AccountId) -> Vec<Topic> {
        match self.existing(account_id) {
            Some(entry) => entry.state.lock().await.subscribed.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Open the push channel and subscribe the connector's default topics.
    /// No-op if the account is already tracked.
    pub async fn start_tracking_account(self: &Arc<Self>, account_id: AccountId) -> AppResult<()> {
        loop {
            let entry = self.entry(account_id);
            let mut state = entry.state.lock().await;
            // a concurrent stop dropped this entry while we waited
            if !self.is_current(account_id, &entry) {
                continue;
            }
            return self.start_locked(account_id, &entry, &mut state).await;
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        account_id: AccountId,
        entry: &Arc<AccountStream>,
        state: &mut StreamState,
    ) -> AppResult<()> {
        if state.status != TrackingStatus::Untracked {
            debug!(account_id = %account_id, status = ?state.status, "Push channel already tracked");
            return Ok(());
        }
        state.status = TrackingStatus::Connecting;

        let account = match self.registry.get_account_by_id(account_id).await {
            Ok(account) => account,
            Err(err) => {
                state.status = TrackingStatus::Untracked;
                return Err(err);
            }
        };
        let connector = match self.connector(account.exchange) {
            Ok(connector) => connector,
            Err(err) => {
                state.status = TrackingStatus::Untracked;
                return Err(err);
            }
        };
        let defaults: BTreeSet<Topic> = connector.default_topics().into_iter().collect();
        let connection = match open(connector.as_ref(), &account, &defaults).await {
            Ok(connection) => connection,
            Err(cause) => {
                state.status = TrackingStatus::Untracked;
                warn!(account_id = %account_id, error = %cause, "⚠️ Push channel setup failed");
                return Err(AppError::TrackingFailed { account_id, cause });
            }
        };

        state.generation += 1;
        state.status = TrackingStatus::Tracking;
        state.channel = Some(connection.channel);
        state.subscribed = defaults;
        let handler = tokio::spawn(self.clone().run_handler(
            account_id,
            entry.clone(),
            state.generation,
            connector,
            connection.inbound,
        ));
        state.handler = Some(handler);
        info!(account_id = %account_id, exchange = %account.exchange, "📡 Push channel tracking");
        Ok(())
    }

    /// Close the channel, forget every subscription and drop the account's
    /// entry.  No-op if untracked.
    pub async fn stop_tracking_account(&self, account_id: AccountId) {
        let Some(entry) = self.existing(account_id) else { return };
        let mut state = entry.state.lock().await;
        self.forget(account_id, &entry);
        if state.status == TrackingStatus::Untracked {
            return;
        }
        if let Some(mut channel) = state.channel.take() {
            channel.close().await;
        }
        if let Some(handler) = state.handler.take() {
            handler.abort();
        }
        state.reset();
        info!(account_id = %account_id, "📴 Push channel stopped");
    }

    /// Subscribe `topics`, sending only those not already subscribed.  Starts
    /// tracking first if needed.  A failed call leaves the local set as it was.
    pub async fn subscribe(self: &Arc<Self>, account_id: AccountId, topics: &[Topic]) -> AppResult<()> {
        self.start_tracking_account(account_id).await?;
        let Some(entry) = self.existing(account_id) else {
            return Err(AppError::TrackingFailed {
                account_id,
                cause: "push channel stopped".into(),
            });
        };
        let mut guard = entry.state.lock().await;
        let state = &mut *guard;

        let delta: BTreeSet<Topic> = topics
            .iter()
            .filter(|t| !state.subscribed.contains(*t))
            .cloned()
            .collect();
        if delta.is_empty() {
            return Ok(());
        }
        let Some(channel) = state.channel.as_mut() else {
            return Err(AppError::TrackingFailed {
                account_id,
                cause: format!("push channel is {:?}", state.status).to_lowercase(),
            });
        };
        let delta: Vec<Topic> = delta.into_iter().collect();
        if let Err(err) = channel.subscribe(&delta).await {
            warn!(account_id = %account_id, topics = ?delta, error = %err, "Subscribe failed");
            return Err(AppError::operation("subscribe", err));
        }
        debug!(account_id = %account_id, topics = ?delta, "Subscribed");
        state.subscribed.extend(delta);
        Ok(())
    }

    /// Unsubscribe `topics` one by one.  Topics not subscribed are skipped; a
    /// failed topic is logged and stays in the set.
    pub async fn unsubscribe(&self, account_id: AccountId, topics: &[Topic]) -> AppResult<()> {
        let Some(entry) = self.existing(account_id) else { return Ok(()) };
        let mut guard = entry.state.lock().await;
        let state = &mut *guard;
        let Some(channel) = state.channel.as_mut() else { return Ok(()) };

        let wanted: BTreeSet<&Topic> = topics.iter().collect();
        for topic in wanted {
            if !state.subscribed.contains(topic) {
                continue;
            }
            match channel.unsubscribe(topic).await {
                Ok(()) => {
                    state.subscribed.remove(topic);
                }
                Err(err) => {
                    warn!(account_id = %account_id, topic = %topic, error = %err, "Unsubscribe failed");
                }
            }
        }
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    async fn run_handler(
        self: Arc<Self>,
        account_id: AccountId,
        entry: Arc<AccountStream>,
        generation: u64,
        connector: Arc<dyn PushConnector>,
        mut inbound: mpsc::UnboundedReceiver<RawMessage>,
    ) {
        loop {
            while let Some(message) = inbound.recv().await {
                self.dispatch(account_id, connector.as_ref(), &message);
            }
            match self
                .reconnect(account_id, &entry, generation, connector.as_ref())
                .await
            {
                Some(next) => inbound = next,
                None => return,
            }
        }
    }

    fn dispatch(&self, account_id: AccountId, connector: &dyn PushConnector, message: &RawMessage) {
        match connector.decode(message) {
            Ok(events) => {
                for event in events {
                    self.publish(account_id, event);
                }
            }
            Err(err) => {
                error!(account_id = %account_id, topic = %message.topic, error = %err, "❌ Push message dropped");
            }
        }
    }

    fn publish(&self, account_id: AccountId, event: StreamEvent) {
        match event {
            StreamEvent::Orders(orders) => {
                if !orders.is_empty() {
                    self.bus.emit(Event::OrdersPushed { account_id, orders });
                }
            }
            StreamEvent::Executions(executions) => {
                for execution in executions {
                    self.bus.emit(Event::ExecutionReceived {
                        account_id,
                        execution,
                    });
                }
            }
            StreamEvent::Positions(positions) => {
                if !positions.is_empty() {
                    self.bus.emit(Event::PositionsPushed {
                        account_id,
                        positions,
                    });
                }
            }
            StreamEvent::Wallet(wallet) => self.bus.emit(Event::WalletPushed {
                account_id,
                wallet: Box::new(wallet),
            }),
            StreamEvent::Ticker { market, bid, ask } => self.bus.emit(Event::TickerPushed {
                account_id,
                market,
                bid,
                ask,
            }),
        }
    }

    /// Reopen a dropped channel with capped exponential backoff and
    /// resubscribe the whole recorded set.  Returns the new inbound stream, or
    /// `None` if tracking was stopped meanwhile or every attempt failed.
    async fn reconnect(
        &self,
        account_id: AccountId,
        entry: &AccountStream,
        generation: u64,
        connector: &dyn PushConnector,
    ) -> Option<mpsc::UnboundedReceiver<RawMessage>> {
        {
            let mut state = entry.state.lock().await;
            if state.generation != generation || state.status != TrackingStatus::Tracking {
                return None;
            }
            state.status = TrackingStatus::Reconnecting;
            state.channel = None;
            warn!(account_id = %account_id, "🔁 Push channel dropped, reconnecting");
        }

        for attempt in 0..self.reconnect.max_attempts {
            tokio::time::sleep(self.reconnect.delay(attempt)).await;
            let mut state = entry.state.lock().await;
            if state.generation != generation || state.status != TrackingStatus::Reconnecting {
                debug!(account_id = %account_id, "Reconnect abandoned, tracking was stopped");
                return None;
            }
            let account = match self.registry.get_account_by_id(account_id).await {
                Ok(account) => account,
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "Account gone, not reconnecting");
                    break;
                }
            };
            match open(connector, &account, &state.subscribed).await {
                Ok(connection) => {
                    state.channel = Some(connection.channel);
                    state.status = TrackingStatus::Tracking;
                    info!(
                        account_id = %account_id,
                        attempt = attempt + 1,
                        topics = state.subscribed.len(),
                        "📡 Push channel reconnected"
                    );
                    return Some(connection.inbound);
                }
                Err(cause) => {
                    warn!(account_id = %account_id, attempt = attempt + 1, error = %cause, "Reconnect attempt failed");
                }
            }
        }

        let mut state = entry.state.lock().await;
        if state.generation == generation {
            state.reset();
            state.handler = None;
            warn!(account_id = %account_id, "⚠️ Giving up on push channel, account untracked");
        }
        None
    }
}

/// Connect and subscribe `topics` in one call.  Closes the channel again if
/// the subscription fails, so no half-open connection survives.
async fn open(
    connector: &dyn PushConnector,
    account: &Account,
    topics: &BTreeSet<Topic>,
) -> Result<Connection, String> {
    let mut connection = connector
        .connect(account)
        .await
        .map_err(|err| err.to_string())?;
    if topics.is_empty() {
        return Ok(connection);
    }
    let topics: Vec<Topic> = topics.iter().cloned().collect();
    if let Err(err) = connection.channel.subscribe(&topics).await {
        connection.channel.close().await;
        return Err(err.to_string());
    }
    Ok(connection)
}
