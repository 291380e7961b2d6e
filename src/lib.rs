//! # perpdesk
//!
//! Multi-account crypto derivatives backend.
//!
//! ```text
//!  ┌────────────┐  REST   ┌──────────────────┐   per account   ┌──────────────────────┐
//!  │  Bybit /   │ ◀────── │ ExchangeService  │ ◀────────────── │  Ticker / Orders /   │
//!  │  Binance / │         └──────────────────┘                 │  Positions / Wallet  │
//!  │  Paper     │  WS     ┌──────────────────┐   EventBus      │  tracking caches     │
//!  │            │ ──────▶ │ StreamManager    │ ──────────────▶ └──────────┬───────────┘
//!  └────────────┘         └──────────────────┘                            │ …Updated
//!                                                                         ▼
//!                                  axum routes · /ws/monitor ◀── StrategyEngine (DCA ladders)
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod models;
pub mod registry;
pub mod routes;
pub mod state;
pub mod stream;

#[cfg(test)]
mod testkit;
