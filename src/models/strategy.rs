//! # models::strategy
//!
//! DCA ladder strategies: the options a client submits, the validated
//! parameters the engine runs on, and the per-cycle order ledger.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::ladder;
use crate::error::{AppError, AppResult};
use crate::models::AccountId;

pub type StrategyId = Uuid;

// ─── Options ──────────────────────────────────────────────────────────────────

/// Unit of the configured order sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyMode {
    /// Sizes are contract quantities.
    Base,
    /// Sizes are notional amounts in the quote currency.
    Quote,
}

impl FromStr for CurrencyMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(CurrencyMode::Base),
            "quote" => Ok(CurrencyMode::Quote),
            other => Err(AppError::InvalidStrategy(format!(
                "currency_mode must be \"base\" or \"quote\", got {other:?}"
            ))),
        }
    }
}

/// Strategy options as submitted.  Nothing here is trusted until
/// [`StrategyOptions::validate`] has turned it into [`LadderParams`].
///
/// Percentages are plain numbers: `1.5` means 1.5 %.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptions {
    pub currency_mode:      Option<String>,
    pub base_order_size:    Option<f64>,
    pub safety_order_size:  Option<f64>,
    pub initial_offset_pct: Option<f64>,
    pub step_scale:         Option<f64>,
    pub volume_scale:       Option<f64>,
    pub take_profit_pct:    Option<f64>,
    pub max_safety_orders:  Option<u32>,
    /// Optional; `None` runs the ladder without a stop.
    pub stop_loss_pct:      Option<f64>,
}

fn positive(name: &str, value: Option<f64>) -> AppResult<f64> {
    match value {
        None => Err(AppError::InvalidStrategy(format!("{name} is required"))),
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(AppError::InvalidStrategy(format!(
            "{name} must be strictly positive, got {v}"
        ))),
    }
}

impl StrategyOptions {
    pub fn validate(&self) -> AppResult<LadderParams> {
        let currency_mode = self
            .currency_mode
            .as_deref()
            .ok_or_else(|| AppError::InvalidStrategy("currency_mode is required".into()))?
            .parse()?;
        let max_safety_orders = match self.max_safety_orders {
            Some(n) if n > 0 => n,
            Some(_) => {
                return Err(AppError::InvalidStrategy(
                    "max_safety_orders must be strictly positive".into(),
                ))
            }
            None => return Err(AppError::InvalidStrategy("max_safety_orders is required".into())),
        };
        let stop_loss_pct = match self.stop_loss_pct {
            None => None,
            some => Some(positive("stop_loss_pct", some)?),
        };
        if stop_loss_pct.is_some_and(|sl| sl >= 100.0) {
            return Err(AppError::InvalidStrategy("stop_loss_pct must be below 100".into()));
        }

        let params = LadderParams {
            currency_mode,
            base_order_size: positive("base_order_size", self.base_order_size)?,
            safety_order_size: positive("safety_order_size", self.safety_order_size)?,
            initial_offset_pct: positive("initial_offset_pct", self.initial_offset_pct)?,
            step_scale: positive("step_scale", self.step_scale)?,
            volume_scale: positive("volume_scale", self.volume_scale)?,
            take_profit_pct: positive("take_profit_pct", self.take_profit_pct)?,
            max_safety_orders,
            stop_loss_pct,
        };

        // every rung must stay at a positive price
        let deepest = ladder::deepest_offset(&params);
        if deepest.is_nan() || deepest >= 100.0 {
            return Err(AppError::InvalidStrategy(format!(
                "deepest safety order sits {deepest:.2}% below entry, must be below 100%"
            )));
        }
        Ok(params)
    }
}

/// Validated ladder parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderParams {
    pub currency_mode:      CurrencyMode,
    pub base_order_size:    f64,
    pub safety_order_size:  f64,
    pub initial_offset_pct: f64,
    pub step_scale:         f64,
    pub volume_scale:       f64,
    pub take_profit_pct:    f64,
    pub max_safety_orders:  u32,
    pub stop_loss_pct:      Option<f64>,
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

/// Live orders and fills of the current cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Every live order id of the cycle, take-profit and stop-loss included.
    pub orders: BTreeSet<String>,
    pub take_profit: Option<String>,
    pub stop_loss: Option<String>,
    /// Sum of filled buy quantity across rungs.
    pub filled_quantity: f64,
    /// Sum of price × quantity across those fills.
    pub filled_cost: f64,
}

impl Ledger {
    /// A cycle is running while it has live orders or an open fill.
    pub fn is_active(&self) -> bool {
        !self.orders.is_empty() || self.filled_quantity > 0.0
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.contains(order_id)
    }

    pub fn record_fill(&mut self, price: f64, quantity: f64) {
        self.filled_quantity += quantity;
        self.filled_cost += price * quantity;
    }

    /// Weighted-average entry over every filled rung.
    pub fn average_entry(&self) -> Option<f64> {
        (self.filled_quantity > 0.0).then(|| self.filled_cost / self.filled_quantity)
    }

    /// Forget an order id, clearing the take-profit / stop-loss slot it held.
    pub fn forget(&mut self, order_id: &str) -> bool {
        if self.take_profit.as_deref() == Some(order_id) {
            self.take_profit = None;
        }
        if self.stop_loss.as_deref() == Some(order_id) {
            self.stop_loss = None;
        }
        self.orders.remove(order_id)
    }
}

// ─── Strategy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id:         StrategyId,
    pub account_id: AccountId,
    pub market:     String,
    pub params:     LadderParams,
    pub ledger:     Ledger,
    /// Number of cycles opened so far.
    pub cycles:     u64,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(account_id: AccountId, market: impl Into<String>, params: LadderParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            market: market.into(),
            params,
            ledger: Ledger::default(),
            cycles: 0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StrategyOptions {
        StrategyOptions {
            currency_mode: Some("base".into()),
            base_order_size: Some(1.0),
            safety_order_size: Some(1.0),
            initial_offset_pct: Some(1.0),
            step_scale: Some(1.5),
            volume_scale: Some(2.0),
            take_profit_pct: Some(1.0),
            max_safety_orders: Some(3),
            stop_loss_pct: None,
        }
    }

    #[test]
    fn test_valid_options() {
        let params = options().validate().unwrap();
        assert_eq!(params.currency_mode, CurrencyMode::Base);
        assert_eq!(params.max_safety_orders, 3);
    }

    #[test]
    fn test_rejects_missing_and_non_positive() {
        let mut missing = options();
        missing.take_profit_pct = None;
        assert!(matches!(missing.validate(), Err(AppError::InvalidStrategy(_))));

        let mut zero = options();
        zero.step_scale = Some(0.0);
        assert!(matches!(zero.validate(), Err(AppError::InvalidStrategy(_))));

        let mut negative_stop = options();
        negative_stop.stop_loss_pct = Some(-2.0);
        assert!(matches!(negative_stop.validate(), Err(AppError::InvalidStrategy(_))));
    }

    #[test]
    fn test_rejects_ladder_reaching_zero_price() {
        let mut steep = options();
        steep.initial_offset_pct = Some(60.0);
        steep.step_scale = Some(2.0);
        steep.max_safety_orders = Some(2);
        let err = steep.validate().unwrap_err();
        assert!(matches!(err, AppError::InvalidStrategy(_)));
        assert!(err.to_string().contains("120.00%"));

        let mut edge = options();
        edge.initial_offset_pct = Some(100.0);
        edge.max_safety_orders = Some(1);
        assert!(edge.validate().is_err());

        steep.max_safety_orders = Some(1);
        assert!(steep.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_currency_mode() {
        let mut bad = options();
        bad.currency_mode = Some("usd".into());
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("currency_mode"));
    }

    #[test]
    fn test_ledger_average_and_forget() {
        let mut ledger = Ledger::default();
        assert_eq!(ledger.average_entry(), None);
        ledger.record_fill(100.0, 1.0);
        ledger.record_fill(90.0, 1.0);
        assert_eq!(ledger.average_entry(), Some(95.0));

        ledger.orders.insert("tp".into());
        ledger.take_profit = Some("tp".into());
        assert!(ledger.forget("tp"));
        assert!(ledger.take_profit.is_none());
        assert!(!ledger.forget("tp"));
    }
}
