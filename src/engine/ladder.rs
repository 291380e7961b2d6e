//! # engine::ladder
//!
//! Pure ladder geometry: where the safety rungs sit, how big they are and
//! where the take-profit and stop-loss go.  No I/O.
//!
//! Offsets are percentages below the cycle's opening price P0.  Rung 0 sits
//! at the initial offset and rung 1 scales it by `step_scale`; from rung 2 on
//! each offset is `previous * step_scale + initial_offset`.  With 1 % / 1.5
//! that gives 1 %, 1.5 %, 3.25 %, 5.875 %.  Sizes compound by `volume_scale`.

use crate::models::{CurrencyMode, LadderParams};

/// One safety rung.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rung {
    pub index:      u32,
    pub offset_pct: f64,
    /// Configured size, in the strategy's currency mode.
    pub size:       f64,
}

impl Rung {
    pub fn price(&self, p0: f64) -> f64 {
        p0 * (1.0 - self.offset_pct / 100.0)
    }
}

pub fn rungs(params: &LadderParams) -> Vec<Rung> {
    let mut rungs = Vec::with_capacity(params.max_safety_orders as usize);
    let mut offset = params.initial_offset_pct;
    let mut size = params.safety_order_size;
    for index in 0..params.max_safety_orders {
        rungs.push(Rung {
            index,
            offset_pct: offset,
            size,
        });
        offset = if index == 0 {
            offset * params.step_scale
        } else {
            offset * params.step_scale + params.initial_offset_pct
        };
        size *= params.volume_scale;
    }
    rungs
}

/// Offset of the last safety rung, in percent below P0.
pub fn deepest_offset(params: &LadderParams) -> f64 {
    rungs(params).last().map_or(0.0, |r| r.offset_pct)
}

/// Order quantity for a configured size at `price`.
pub fn quantity(mode: CurrencyMode, size: f64, price: f64) -> f64 {
    match mode {
        CurrencyMode::Base => size,
        CurrencyMode::Quote => size / price,
    }
}

pub fn take_profit_price(entry: f64, take_profit_pct: f64) -> f64 {
    entry * (1.0 + take_profit_pct / 100.0)
}

pub fn stop_loss_price(p0: f64, stop_loss_pct: f64) -> f64 {
    p0 * (1.0 - stop_loss_pct / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LadderParams {
        LadderParams {
            currency_mode: CurrencyMode::Base,
            base_order_size: 1.0,
            safety_order_size: 1.0,
            initial_offset_pct: 1.0,
            step_scale: 1.5,
            volume_scale: 2.0,
            take_profit_pct: 1.0,
            max_safety_orders: 4,
            stop_loss_pct: None,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_offsets_and_sizes_compound() {
        let rungs = rungs(&params());
        let offsets: Vec<f64> = rungs.iter().map(|r| r.offset_pct).collect();
        let sizes: Vec<f64> = rungs.iter().map(|r| r.size).collect();

        assert!(close(offsets[0], 1.0));
        assert!(close(offsets[1], 1.5));
        assert!(close(offsets[2], 3.25));
        assert!(close(offsets[3], 5.875));
        assert_eq!(sizes, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_rung_prices_sit_below_p0() {
        let rungs = rungs(&params());
        assert!(close(rungs[0].price(100.0), 99.0));
        assert!(close(rungs[2].price(100.0), 96.75));
    }

    #[test]
    fn test_deepest_offset() {
        assert!(close(deepest_offset(&params()), 5.875));
        let mut steep = params();
        steep.initial_offset_pct = 60.0;
        steep.step_scale = 2.0;
        steep.max_safety_orders = 2;
        assert!(close(deepest_offset(&steep), 120.0));
    }

    #[test]
    fn test_quote_mode_converts_notional() {
        assert_eq!(quantity(CurrencyMode::Base, 2.0, 50.0), 2.0);
        assert_eq!(quantity(CurrencyMode::Quote, 100.0, 50.0), 2.0);
    }

    #[test]
    fn test_take_profit_and_stop() {
        assert!(close(take_profit_price(95.0, 1.0), 95.95));
        assert!(close(stop_loss_price(100.0, 10.0), 90.0));
    }
}
