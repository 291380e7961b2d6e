//! # models::wallet
//!
//! Account balances.  `equity` is expressed in the account's quote currency
//! (USDT for every linear venue we support).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUOTE_CURRENCY: &str = "USDT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
    #[serde(default)]
    pub debt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub quote_currency: String,
    pub equity: f64,
    /// Per-currency breakdown, keyed by currency code.
    pub balances: BTreeMap<String, Balance>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty() -> Self {
        Self {
            quote_currency: DEFAULT_QUOTE_CURRENCY.to_string(),
            equity: 0.0,
            balances: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Shallow comparison: equity plus free/used/total/debt per currency.
    pub fn same_balances(&self, other: &Wallet) -> bool {
        self.quote_currency == other.quote_currency
            && self.equity == other.equity
            && self.balances == other.balances
    }

    /// Overlay the currencies present in `update`.
    pub fn merge(&mut self, update: &Wallet) {
        for (currency, balance) in &update.balances {
            self.balances.insert(currency.clone(), balance.clone());
        }
        self.equity = update.equity;
        self.updated_at = Utc::now();
    }
}
