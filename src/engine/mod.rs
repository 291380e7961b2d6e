//! # engine
//!
//! Trading logic.  `ladder` is the pure DCA geometry, `dca` the engine that
//! drives ladders from cache and push events.

pub mod dca;
pub mod ladder;

pub use dca::StrategyEngine;
