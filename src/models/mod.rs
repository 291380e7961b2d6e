//! Domain models shared across adapters, push channels, caches and strategies.

pub mod account;
pub mod market;
pub mod order;
pub mod position;
pub mod strategy;
pub mod tick;
pub mod wallet;

pub use account::{Account, AccountId, Credentials, ExchangeKind};
pub use market::Market;
pub use order::{
    same_orders, Execution, Order, OrderParams, OrderRequest, OrderSide, OrderStatus, OrderType,
    OrderUpdate,
};
pub use position::{same_positions, Position};
pub use strategy::{
    CurrencyMode, LadderParams, Ledger, Strategy, StrategyId, StrategyOptions,
};
pub use tick::Ticker;
pub use wallet::{Balance, Wallet, DEFAULT_QUOTE_CURRENCY};
