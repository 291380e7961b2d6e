//! # exchange::factory
//!
//! Type-keyed registry of adapter constructors.  `create_exchange` builds the
//! adapter for an account and runs `initialize()` before handing it out, so a
//! returned adapter is always authenticated.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::binance::BinanceExchange;
use super::bybit::BybitExchange;
use super::paper::{PaperExchange, PaperVenue};
use super::{AdapterError, AdapterResult, ExchangeAdapter};
use crate::config::ExchangeEndpoints;
use crate::error::{AppError, AppResult};
use crate::models::{Account, ExchangeKind};

pub type AdapterHandle = Arc<dyn ExchangeAdapter>;

type Constructor = Arc<dyn Fn(&Account) -> AdapterResult<AdapterHandle> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExchangeFactory {
    constructors: HashMap<ExchangeKind, Constructor>,
}

impl ExchangeFactory {
    /// A factory with no exchange types registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bybit, Binance and the paper venue.
    pub fn standard(endpoints: ExchangeEndpoints, venue: Arc<PaperVenue>) -> Self {
        let mut factory = Self::empty();
        let bybit = endpoints.bybit.clone();
        factory.register(ExchangeKind::Bybit, move |account| {
            Ok(Arc::new(BybitExchange::new(account, &bybit)?) as AdapterHandle)
        });
        let binance = endpoints.binance;
        factory.register(ExchangeKind::Binance, move |account| {
            Ok(Arc::new(BinanceExchange::new(account, &binance)?) as AdapterHandle)
        });
        factory.register(ExchangeKind::Paper, move |account| {
            Ok(Arc::new(PaperExchange::new(
                account.id,
                account.credentials.api_key.clone(),
                venue.clone(),
            )) as AdapterHandle)
        });
        factory
    }

    pub fn register<F>(&mut self, kind: ExchangeKind, constructor: F) -> &mut Self
    where
        F: Fn(&Account) -> AdapterResult<AdapterHandle> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
        self
    }

    pub fn supports(&self, kind: ExchangeKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build and initialise the adapter for `account`.
    ///
    /// * unregistered type → `UnsupportedExchange`
    /// * rejected credentials → `InvalidCredentials`
    /// * anything else → `InitError`
    pub async fn create_exchange(&self, account: &Account) -> AppResult<AdapterHandle> {
        let constructor = self
            .constructors
            .get(&account.exchange)
            .ok_or_else(|| AppError::UnsupportedExchange(account.exchange.to_string()))?;

        let adapter = constructor(account).map_err(|err| init_error(account, err))?;
        adapter
            .initialize()
            .await
            .map_err(|err| init_error(account, err))?;

        info!(
            account_id = %account.id,
            exchange = %account.exchange,
            "🔌 Exchange adapter initialised"
        );
        Ok(adapter)
    }
}

fn init_error(account: &Account, err: AdapterError) -> AppError {
    warn!(account_id = %account.id, exchange = %account.exchange, error = %err, "Exchange init failed");
    match err {
        AdapterError::Authentication(msg) => AppError::InvalidCredentials(msg),
        other => AppError::InitError(other.to_string()),
    }
}
