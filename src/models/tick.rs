//! # models::tick
//!
//! Defines [`Ticker`], the best bid/ask snapshot for one market as seen by one
//! account's exchange connection.
//!
//! Either side can be missing: push feeds deliver deltas that only carry the
//! side that moved, and thin markets can have an empty book side.  The derived
//! mid price is therefore an `Option`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Best bid/ask for a single market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Exchange symbol, e.g. `"BTCUSDT"`.
    pub market: String,

    /// Best bid (highest price someone will buy at).
    #[serde(default)]
    pub bid: Option<f64>,

    /// Best ask (lowest price someone will sell at).
    #[serde(default)]
    pub ask: Option<f64>,

    /// When this snapshot was last changed locally.
    pub updated_at: DateTime<Utc>,
}

impl Ticker {
    pub fn new(market: impl Into<String>, bid: Option<f64>, ask: Option<f64>) -> Self {
        Self {
            market: market.into(),
            bid,
            ask,
            updated_at: Utc::now(),
        }
    }

    /// Empty snapshot for a market that is tracked but not priced yet.
    pub fn empty(market: impl Into<String>) -> Self {
        Self::new(market, None, None)
    }

    /// Mid price `(bid + ask) / 2`, defined only when both sides are present.
    #[inline]
    pub fn price(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// `true` if the raw quote fields are identical (timestamps ignored).
    pub fn same_quote(&self, other: &Ticker) -> bool {
        self.market == other.market && self.bid == other.bid && self.ask == other.ask
    }

    /// Overlay the sides present in `update`, keeping the others.
    ///
    /// Returns `true` when at least one raw field changed.
    pub fn merge(&mut self, bid: Option<f64>, ask: Option<f64>) -> bool {
        let mut changed = false;
        if let Some(bid) = bid {
            if self.bid != Some(bid) {
                self.bid = Some(bid);
                changed = true;
            }
        }
        if let Some(ask) = ask {
            if self.ask != Some(ask) {
                self.ask = Some(ask);
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midpoint_both_sides() {
        let ticker = Ticker::new("BTCUSDT", Some(10.0), Some(12.0));
        assert_eq!(ticker.price(), Some(11.0));
    }

    #[test]
    fn test_midpoint_single_side_is_undefined() {
        let ticker = Ticker::new("BTCUSDT", Some(10.0), None);
        assert_eq!(ticker.price(), None);
    }

    #[test]
    fn test_merge_keeps_missing_side() {
        let mut ticker = Ticker::new("BTCUSDT", Some(10.0), Some(12.0));
        assert!(ticker.merge(None, Some(14.0)));
        assert_eq!(ticker.bid, Some(10.0));
        assert_eq!(ticker.price(), Some(12.0));
        assert!(!ticker.merge(Some(10.0), None));
    }
}
