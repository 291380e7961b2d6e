//! # config — reads configuration from environment variables
//!
//! | Variable                     | Default                          |
//! |------------------------------|----------------------------------|
//! | `BIND_ADDR`                  | `0.0.0.0:3000`                   |
//! | `TICKER_REFRESH_MS`          | `2000`                           |
//! | `ORDERS_REFRESH_MS`          | `5000`                           |
//! | `POSITIONS_REFRESH_MS`       | `5000`                           |
//! | `WALLET_REFRESH_MS`          | `15000`                          |
//! | `STREAM_RECONNECT_BASE_MS`   | `1000`                           |
//! | `STREAM_RECONNECT_MAX_MS`    | `60000`                          |
//! | `STREAM_RECONNECT_ATTEMPTS`  | `8`                              |
//! | `EVENT_BUS_CAPACITY`         | `4096`                           |
//! | `ACCOUNTS_FILE`              | unset (empty registry)           |
//! | `BYBIT_REST_URL`             | `https://api.bybit.com`          |
//! | `BYBIT_WS_URL`               | `wss://stream.bybit.com`         |
//! | `BINANCE_REST_URL`           | `https://fapi.binance.com`       |
//! | `BINANCE_WS_URL`             | `wss://fstream.binance.com`      |

use std::time::Duration;

// ─── Endpoints ────────────────────────────────────────────────────────────────

/// REST + websocket base URLs for one exchange, mainnet and testnet.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub rest_url: String,
    pub ws_url: String,
    pub testnet_rest_url: String,
    pub testnet_ws_url: String,
}

impl Endpoints {
    pub fn rest(&self, testnet: bool) -> &str {
        if testnet { &self.testnet_rest_url } else { &self.rest_url }
    }

    pub fn ws(&self, testnet: bool) -> &str {
        if testnet { &self.testnet_ws_url } else { &self.ws_url }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeEndpoints {
    pub bybit: Endpoints,
    pub binance: Endpoints,
}

impl ExchangeEndpoints {
    pub fn from_env() -> Self {
        Self {
            bybit: Endpoints {
                rest_url:         env_string("BYBIT_REST_URL", "https://api.bybit.com"),
                ws_url:           env_string("BYBIT_WS_URL", "wss://stream.bybit.com"),
                testnet_rest_url: env_string("BYBIT_TESTNET_REST_URL", "https://api-testnet.bybit.com"),
                testnet_ws_url:   env_string("BYBIT_TESTNET_WS_URL", "wss://stream-testnet.bybit.com"),
            },
            binance: Endpoints {
                rest_url:         env_string("BINANCE_REST_URL", "https://fapi.binance.com"),
                ws_url:           env_string("BINANCE_WS_URL", "wss://fstream.binance.com"),
                testnet_rest_url: env_string("BINANCE_TESTNET_REST_URL", "https://testnet.binancefuture.com"),
                testnet_ws_url:   env_string("BINANCE_TESTNET_WS_URL", "wss://stream.binancefuture.com"),
            },
        }
    }
}

impl Default for ExchangeEndpoints {
    fn default() -> Self {
        Self::from_env()
    }
}

// ─── Refresh cadences ─────────────────────────────────────────────────────────

/// Polling cadence per tracking cache.  Each runs on its own timer.
#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub ticker:    Duration,
    pub orders:    Duration,
    pub positions: Duration,
    pub wallet:    Duration,
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            ticker:    Duration::from_millis(env_u64("TICKER_REFRESH_MS", 2_000)),
            orders:    Duration::from_millis(env_u64("ORDERS_REFRESH_MS", 5_000)),
            positions: Duration::from_millis(env_u64("POSITIONS_REFRESH_MS", 5_000)),
            wallet:    Duration::from_millis(env_u64("WALLET_REFRESH_MS", 15_000)),
        }
    }
}

// ─── Push-channel reconnect ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay:   Duration,
    pub max_delay:    Duration,
    /// Give up (leave the account untracked) after this many failed attempts.
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn from_env() -> Self {
        Self {
            base_delay:   Duration::from_millis(env_u64("STREAM_RECONNECT_BASE_MS", 1_000)),
            max_delay:    Duration::from_millis(env_u64("STREAM_RECONNECT_MAX_MS", 60_000)),
            max_attempts: env_u32("STREAM_RECONNECT_ATTEMPTS", 8),
        }
    }

    /// Capped exponential delay before attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay:   Duration::from_millis(1_000),
            max_delay:    Duration::from_millis(60_000),
            max_attempts: 8,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr:          String,
    pub refresh:            RefreshConfig,
    pub reconnect:          ReconnectConfig,
    pub endpoints:          ExchangeEndpoints,
    pub event_bus_capacity: usize,
    pub accounts_file:      Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr:          env_string("BIND_ADDR", "0.0.0.0:3000"),
            refresh:            RefreshConfig::from_env(),
            reconnect:          ReconnectConfig::from_env(),
            endpoints:          ExchangeEndpoints::from_env(),
            event_bus_capacity: env_u64("EVENT_BUS_CAPACITY", 4_096) as usize,
            accounts_file:      std::env::var("ACCOUNTS_FILE").ok().filter(|v| !v.is_empty()),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
