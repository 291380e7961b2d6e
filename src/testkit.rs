//! Shared fixtures for unit tests: a paper venue wired to a registry, an
//! exchange service and an event bus.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::events::{Event, EventBus};
use crate::exchange::factory::AdapterHandle;
use crate::exchange::paper::{PaperExchange, PaperVenue};
use crate::exchange::{ExchangeFactory, ExchangeService};
use crate::models::{Account, AccountId, Credentials, ExchangeKind};
use crate::registry::InMemoryAccountRegistry;
use crate::state::{AppState, SharedState};
use crate::stream::paper::PaperConnector;
use crate::stream::StreamManager;

pub(crate) fn paper_account(name: &str) -> Account {
    Account::new(
        name,
        ExchangeKind::Paper,
        Credentials {
            api_key: format!("{name}-key"),
            api_secret: "secret".into(),
            testnet: true,
        },
    )
}

pub(crate) fn paper_factory(venue: Arc<PaperVenue>) -> ExchangeFactory {
    let mut factory = ExchangeFactory::empty();
    factory.register(ExchangeKind::Paper, move |account| {
        Ok(Arc::new(PaperExchange::new(
            account.id,
            account.credentials.api_key.clone(),
            venue.clone(),
        )) as AdapterHandle)
    });
    factory
}

pub(crate) struct Harness {
    pub venue: Arc<PaperVenue>,
    pub registry: Arc<InMemoryAccountRegistry>,
    pub bus: EventBus,
    pub exchange: Arc<ExchangeService>,
}

impl Harness {
    pub fn new() -> Self {
        let venue = PaperVenue::new();
        let registry = Arc::new(InMemoryAccountRegistry::new());
        let bus = EventBus::new(1024);
        let exchange = Arc::new(ExchangeService::new(
            paper_factory(venue.clone()),
            registry.clone(),
            bus.clone(),
        ));
        Self {
            venue,
            registry,
            bus,
            exchange,
        }
    }

    pub async fn add_account(&self, name: &str) -> AccountId {
        let account = paper_account(name);
        let id = account.id;
        self.registry.upsert(account).await;
        id
    }
}

/// Full application state over the paper venue only.
pub(crate) fn paper_state() -> SharedState {
    let config = AppConfig::from_env();
    let bus = EventBus::new(1024);
    let venue = PaperVenue::new();
    let registry = Arc::new(InMemoryAccountRegistry::new());
    let mut streams = StreamManager::new(registry.clone(), bus.clone(), config.reconnect);
    streams.register(Arc::new(PaperConnector::new(venue.clone())));
    let factory = paper_factory(venue.clone());
    Arc::new(AppState::from_parts(config, bus, venue, registry, factory, streams))
}

/// Everything currently queued on a bus receiver.
pub(crate) fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Names of the queued events, filtered to one family (e.g. `"orders."`).
pub(crate) fn drain_names(rx: &mut broadcast::Receiver<Event>, prefix: &str) -> Vec<&'static str> {
    drain(rx)
        .into_iter()
        .map(|e| e.name())
        .filter(|name| name.starts_with(prefix))
        .collect()
}
