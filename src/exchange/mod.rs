//! # exchange
//!
//! The uniform exchange contract ([`ExchangeAdapter`]), one implementation per
//! [`ExchangeKind`], the type-keyed [`factory`] that builds them, and the
//! [`service`] that owns the single live adapter per account.
//!
//! ```text
//!  Account ──▶ ExchangeFactory ──▶ Arc<dyn ExchangeAdapter>  (bybit | binance | paper)
//!                                          │
//!                        ExchangeService ──┘  wraps every call:
//!                                             auth failure → InvalidCredentials
//!                                             anything else → OperationFailed(op, cause)
//! ```
//!
//! Adding an exchange = one adapter module + one factory registration.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    ExchangeKind, Market, Order, OrderRequest, OrderSide, OrderUpdate, Position, Ticker, Wallet,
};

pub mod binance;
pub mod bybit;
pub mod factory;
pub mod paper;
pub mod service;
pub(crate) mod signing;

pub use factory::ExchangeFactory;
pub use service::ExchangeService;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Raw failure reported by an adapter, before the service wraps it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// Network failures, timeouts, dropped sockets.
    #[error("transport error: {0}")]
    Transport(String),
    /// Missing or rejected API credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Parameters the exchange cannot accept.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Response body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Business error reported by the exchange (e.g. insufficient margin).
    #[error("exchange error: {0}")]
    Exchange(String),
}

impl AdapterError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Uniform operations every exchange implementation provides.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Verify connectivity and credentials.  Called once by the factory.
    async fn initialize(&self) -> AdapterResult<()>;

    async fn get_balances(&self) -> AdapterResult<Wallet>;

    async fn get_markets(&self) -> AdapterResult<Vec<Market>>;

    async fn get_ticker(&self, market: &str) -> AdapterResult<Ticker>;

    async fn get_open_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>>;

    /// Open and recently closed orders.
    async fn get_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>>;

    async fn get_order(&self, id: &str, market: &str) -> AdapterResult<Order>;

    async fn get_open_positions(&self) -> AdapterResult<Vec<Position>>;

    async fn open_order(&self, request: &OrderRequest) -> AdapterResult<Order>;

    async fn update_order(&self, update: &OrderUpdate) -> AdapterResult<Order>;

    async fn cancel_order(&self, id: &str, market: &str) -> AdapterResult<()>;

    /// Cancel every open order on `market`.
    async fn cancel_orders(&self, market: &str) -> AdapterResult<()>;

    /// Flatten a position with an opposite-side reduce-only market order for
    /// its full size.
    ///
    /// The size is read right before the order goes out; a fill landing in
    /// between leaves a residual or an over-close rejected by reduce-only.
    async fn close_position(&self, market: &str, side: OrderSide) -> AdapterResult<Order> {
        let positions = self.get_open_positions().await?;
        let position = positions
            .iter()
            .find(|p| p.market == market && p.side == side && !p.is_flat())
            .ok_or_else(|| {
                AdapterError::InvalidRequest(format!("no open {side:?} position on {market}"))
            })?;
        let request = OrderRequest::market(market, side.opposite(), position.size).reduce_only();
        self.open_order(&request).await
    }

    /// Release clients and background tasks before the adapter is dropped.
    async fn clean(&self) -> AdapterResult<()>;
}
