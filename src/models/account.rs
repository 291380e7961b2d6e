//! # models::account
//!
//! Exchange accounts as stored by the account registry.  Everything else in
//! the system refers to an account by [`AccountId`] only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

pub type AccountId = Uuid;

// ─── ExchangeKind ─────────────────────────────────────────────────────────────

/// The closed set of supported exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Bybit,
    Binance,
    /// In-process simulated venue (dry runs and tests).
    Paper,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Bybit => "bybit",
            ExchangeKind::Binance => "binance",
            ExchangeKind::Paper => "paper",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bybit" => Ok(ExchangeKind::Bybit),
            "binance" | "binanceusdm" => Ok(ExchangeKind::Binance),
            "paper" | "mock" => Ok(ExchangeKind::Paper),
            other => Err(AppError::UnsupportedExchange(other.to_string())),
        }
    }
}

// ─── Credentials ──────────────────────────────────────────────────────────────

/// API key pair for one account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    /// Route REST/WS traffic to the exchange testnet.
    #[serde(default)]
    pub testnet: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("testnet", &self.testnet)
            .finish()
    }
}

// ─── Account ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub exchange: ExchangeKind,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
}

impl Account {
    pub fn new(name: impl Into<String>, exchange: ExchangeKind, credentials: Credentials) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            exchange,
            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_parse() {
        assert_eq!("Bybit".parse::<ExchangeKind>().unwrap(), ExchangeKind::Bybit);
        assert_eq!("mock".parse::<ExchangeKind>().unwrap(), ExchangeKind::Paper);
        assert!(matches!(
            "kraken".parse::<ExchangeKind>(),
            Err(AppError::UnsupportedExchange(name)) if name == "kraken"
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials {
            api_key: "key".into(),
            api_secret: "super-secret".into(),
            testnet: false,
        };
        assert!(!format!("{creds:?}").contains("super-secret"));
    }
}
