use crate::config::{AdxFilterMode, FilterParams, RsiFilterMode, ATR_PERIOD};
use crate::indicators;
use crate::regime::MarketRegime;
use crate::structure;
use crate::types::{Candle, Direction, OrderBlock};

const RSI_PERIOD: usize = 14;

/// AND-composition of the enabled entry filters, short-circuiting on the
/// first failure. Ok carries the number of filters that passed (diagnostics).
pub fn evaluate(
    ob: &OrderBlock,
    candles: &[Candle],
    regime: Option<&MarketRegime>,
    fp: &FilterParams,
) -> Result<usize, String> {
    let dir = ob.direction;
    let mut passed = 0usize;

    if fp.atr_range {
        atr_range_ok(candles, fp)?;
        passed += 1;
    }
    if fp.cvd {
        cvd_ok(candles, dir, fp)?;
        passed += 1;
    }
    if fp.bos {
        if !structure::break_of_structure(candles, dir, fp.bos_lookback) {
            return Err(format!("no break of structure ({})", dir.as_str()));
        }
        passed += 1;
    }
    if fp.sweep {
        if !structure::liquidity_sweep(candles, dir, fp.sweep_lookback) {
            return Err("no liquidity sweep".to_string());
        }
        passed += 1;
    }
    if fp.ema_align {
        if !structure::ema_alignment(candles, dir) {
            return Err(format!("EMAs not aligned {}", dir.as_str()));
        }
        passed += 1;
    }
    if fp.fvg {
        fvg_ok(ob, candles, fp)?;
        passed += 1;
    }
    if fp.adx != AdxFilterMode::Off {
        adx_ok(candles, fp)?;
        passed += 1;
    }
    if fp.rsi != RsiFilterMode::Off {
        rsi_ok(candles, dir, fp)?;
        passed += 1;
    }
    if fp.regime {
        regime_ok(regime, fp)?;
        passed += 1;
    }

    Ok(passed)
}

/// Subset re-checked immediately before a limit-order fill: volatility band
/// and order-flow direction.
pub fn prefill(candles: &[Candle], direction: Direction, fp: &FilterParams) -> Result<(), String> {
    if fp.atr_range {
        atr_range_ok(candles, fp)?;
    }
    if fp.cvd {
        cvd_ok(candles, direction, fp)?;
    }
    Ok(())
}

fn atr_range_ok(candles: &[Candle], fp: &FilterParams) -> Result<(), String> {
    let pct = indicators::atr_pct(candles, ATR_PERIOD);
    if pct < fp.atr_min_pct || pct > fp.atr_max_pct {
        return Err(format!(
            "ATR% {:.2} outside [{:.2}, {:.2}]",
            pct, fp.atr_min_pct, fp.atr_max_pct
        ));
    }
    Ok(())
}

/// Delta trend over the most recent `cvd_trend_bars` must point with the
/// trade.
fn cvd_ok(candles: &[Candle], direction: Direction, fp: &FilterParams) -> Result<(), String> {
    let series = indicators::cvd_series(candles, fp.cvd_lookback);
    if series.len() <= fp.cvd_trend_bars {
        return Err("CVD: insufficient history".to_string());
    }
    let trend = series[series.len() - 1] - series[series.len() - 1 - fp.cvd_trend_bars];
    let ok = match direction {
        Direction::Long => trend > 0.0,
        Direction::Short => trend < 0.0,
    };
    if !ok {
        return Err(format!("CVD trend {:+.1} against {}", trend, direction.as_str()));
    }
    Ok(())
}

/// A fair-value gap near the candidate bar that geometrically overlaps the
/// block.
fn fvg_ok(ob: &OrderBlock, candles: &[Candle], fp: &FilterParams) -> Result<(), String> {
    let Some((gap_lo, gap_hi)) =
        structure::find_fvg(candles, ob.direction, fp.fvg_min_gap_pct, fp.fvg_lookback)
    else {
        return Err("no fair-value gap in window".to_string());
    };
    if gap_lo > ob.top || gap_hi < ob.bottom {
        return Err("FVG does not overlap the block".to_string());
    }
    Ok(())
}

fn adx_ok(candles: &[Candle], fp: &FilterParams) -> Result<(), String> {
    let Some(v) = indicators::adx(candles, ATR_PERIOD) else {
        return Err("ADX: insufficient history".to_string());
    };
    match fp.adx {
        AdxFilterMode::Strong if v < fp.adx_threshold => {
            Err(format!("ADX {:.1} below {:.1}", v, fp.adx_threshold))
        }
        AdxFilterMode::Weak if v >= fp.adx_threshold => {
            Err(format!("ADX {:.1} at/above {:.1}", v, fp.adx_threshold))
        }
        _ => Ok(()),
    }
}

fn rsi_ok(candles: &[Candle], direction: Direction, fp: &FilterParams) -> Result<(), String> {
    let Some(v) = indicators::rsi(candles, RSI_PERIOD) else {
        return Err("RSI: insufficient history".to_string());
    };
    match (fp.rsi, direction) {
        (RsiFilterMode::Filter, Direction::Long) if v >= fp.rsi_overbought => {
            Err(format!("RSI {:.1} overbought", v))
        }
        (RsiFilterMode::Filter, Direction::Short) if v <= fp.rsi_oversold => {
            Err(format!("RSI {:.1} oversold", v))
        }
        (RsiFilterMode::Contrarian, Direction::Long) if v > fp.rsi_oversold => {
            Err(format!("RSI {:.1} not oversold (contrarian long)", v))
        }
        (RsiFilterMode::Contrarian, Direction::Short) if v < fp.rsi_overbought => {
            Err(format!("RSI {:.1} not overbought (contrarian short)", v))
        }
        _ => Ok(()),
    }
}

fn regime_ok(regime: Option<&MarketRegime>, fp: &FilterParams) -> Result<(), String> {
    let Some(r) = regime else {
        return Err("regime unavailable".to_string());
    };
    if let Some(required) = fp.regime_required {
        if r.regime != required {
            return Err(format!("regime {} ≠ required {}", r.regime.as_str(), required.as_str()));
        }
    }
    if r.confidence < fp.regime_min_confidence {
        return Err(format!(
            "regime confidence {:.0} below {:.0}",
            r.confidence, fp.regime_min_confidence
        ));
    }
    Ok(())
}
