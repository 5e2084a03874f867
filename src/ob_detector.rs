use crate::config::{
    StrategyParams, FAILED_OB_WINDOW_BARS, OB_MIN_SIZE_ATR, TREND_MIN_SIDE_BARS,
    TREND_MIN_SMA_DIST, TREND_SLOPE_BARS, TREND_SMA_PERIOD,
};
use crate::indicators;
use crate::types::{Candle, Direction, FailedOb, OrderBlock};

pub const METHOD_ORB: &str = "ORB";

/// Evaluate the newest candle against the opening-range-breakout thresholds.
///
/// Bullish: close>open, range > ATR×orbAtrMult, volume ratio > orbVolMult,
/// body ratio > minBodyRatio, close above the long SMA. Mirrored for bearish.
pub fn detect(
    candles: &[Candle],
    atr: f64,
    vol_avg50: f64,
    trend_sma: f64,
    p: &StrategyParams,
) -> Option<OrderBlock> {
    let c = candles.last()?;
    let i = candles.len() - 1;
    if atr <= 0.0 || vol_avg50 <= 0.0 { return None; }

    let range = c.range();
    if range <= 0.0 { return None; } // zero-range candle: not enough information
    if range <= atr * p.orb_atr_mult { return None; }

    let vol_ratio = c.volume / vol_avg50;
    if vol_ratio <= p.orb_vol_mult { return None; }
    if c.body_ratio() <= p.min_body_ratio { return None; }

    let direction = if c.is_bullish() && c.close > trend_sma {
        Direction::Long
    } else if !c.is_bullish() && c.close < trend_sma {
        Direction::Short
    } else {
        return None;
    };

    Some(OrderBlock {
        direction,
        top: c.high,
        bottom: c.low,
        method: METHOD_ORB,
        detected_bar: i,
        age: 0,
        moved_away: false,
        volume_ratio: vol_ratio,
        filter_score: 0.0,
    })
}

/// Rejection filters applied to newly-detected blocks only. Returns the
/// reason the candidate is discarded, or None if it survives.
pub fn rejection_reason(
    ob: &OrderBlock,
    candles: &[Candle],
    atr: f64,
    trend_sma: f64,
    failed_obs: &[FailedOb],
    _p: &StrategyParams,
) -> Option<String> {
    // 1. Size filter
    if ob.size() < atr * OB_MIN_SIZE_ATR {
        return Some(format!(
            "OB too small: size {:.4} < ATR×{} ({:.4})",
            ob.size(), OB_MIN_SIZE_ATR, atr * OB_MIN_SIZE_ATR
        ));
    }

    // 2. Trend filter against the long SMA
    let close = candles.last()?.close;
    let n = candles.len();
    match ob.direction {
        Direction::Long => {
            if close < trend_sma * (1.0 + TREND_MIN_SMA_DIST) {
                return Some(format!(
                    "trend: close {:.4} within {:.0}% of SMA {:.4}",
                    close, TREND_MIN_SMA_DIST * 100.0, trend_sma
                ));
            }
        }
        Direction::Short => {
            if close > trend_sma * (1.0 - TREND_MIN_SMA_DIST) {
                return Some(format!(
                    "trend: close {:.4} within {:.0}% of SMA {:.4}",
                    close, TREND_MIN_SMA_DIST * 100.0, trend_sma
                ));
            }
        }
    }

    // SMA slope over the last TREND_SLOPE_BARS must not oppose the block.
    // Skipped when history is too short to measure (warm-up guarantees it in
    // the live path).
    if n > TREND_SLOPE_BARS {
        if let Some(sma_then) = indicators::sma(&candles[..n - TREND_SLOPE_BARS], TREND_SMA_PERIOD) {
            let opposes = match ob.direction {
                Direction::Long => trend_sma < sma_then,
                Direction::Short => trend_sma > sma_then,
            };
            if opposes {
                return Some(format!(
                    "trend: SMA slope opposes {} over last {} bars",
                    ob.direction.as_str(), TREND_SLOPE_BARS
                ));
            }
        }
    }

    // Sustained trend: enough of the recent closes on the required side.
    let recent = &candles[n.saturating_sub(TREND_SLOPE_BARS)..];
    let on_side = recent.iter().filter(|c| match ob.direction {
        Direction::Long => c.close > trend_sma,
        Direction::Short => c.close < trend_sma,
    }).count();
    if on_side < TREND_MIN_SIDE_BARS {
        return Some(format!(
            "trend: only {}/{} bars on the {} side of the SMA",
            on_side, TREND_SLOPE_BARS, ob.direction.as_str()
        ));
    }

    // 3. Failed-OB memory: don't retest a recent loser
    let half_width = ob.size() * 0.5;
    let bar = ob.detected_bar;
    for f in failed_obs {
        if bar.saturating_sub(f.bar) <= FAILED_OB_WINDOW_BARS
            && (ob.midpoint() - f.midpoint).abs() <= half_width
        {
            return Some(format!(
                "retests failed OB at {:.4} ({} bars ago)",
                f.midpoint, bar.saturating_sub(f.bar)
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume }
    }

    fn base_window() -> Vec<Candle> {
        // 30 quiet candles well above a nominal SMA of 90
        (0..30).map(|_| candle(100.0, 100.5, 99.5, 100.2, 100.0)).collect()
    }

    fn params() -> StrategyParams {
        StrategyParams::default()
    }

    #[test]
    fn strong_bullish_breakout_detected() {
        let mut candles = base_window();
        // range 3.0 vs ATR 1.0, volume 3× avg, body 90%
        candles.push(candle(100.0, 103.1, 100.1, 102.8, 300.0));
        let ob = detect(&candles, 1.0, 100.0, 90.0, &params()).unwrap();
        assert_eq!(ob.direction, Direction::Long);
        assert_eq!(ob.top, 103.1);
        assert_eq!(ob.bottom, 100.1);
        assert!((ob.volume_ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn bearish_breakout_mirrors() {
        let mut candles = base_window();
        candles.push(candle(103.0, 103.1, 100.0, 100.2, 300.0));
        let ob = detect(&candles, 1.0, 100.0, 110.0, &params()).unwrap();
        assert_eq!(ob.direction, Direction::Short);
    }

    #[test]
    fn weak_body_not_detected() {
        let mut candles = base_window();
        // Same range/volume but a 30% body
        candles.push(candle(101.0, 103.1, 100.1, 101.9, 300.0));
        assert!(detect(&candles, 1.0, 100.0, 90.0, &params()).is_none());
    }

    #[test]
    fn close_below_sma_blocks_long() {
        let mut candles = base_window();
        candles.push(candle(100.0, 103.1, 100.1, 102.8, 300.0));
        assert!(detect(&candles, 1.0, 100.0, 200.0, &params()).is_none());
    }

    #[test]
    fn zero_range_candle_skipped() {
        let mut candles = base_window();
        candles.push(candle(100.0, 100.0, 100.0, 100.0, 300.0));
        assert!(detect(&candles, 1.0, 100.0, 90.0, &params()).is_none());
    }

    fn detected(candles: &[Candle]) -> OrderBlock {
        OrderBlock {
            direction: Direction::Long,
            top: 103.0,
            bottom: 100.0,
            method: METHOD_ORB,
            detected_bar: candles.len() - 1,
            age: 0,
            moved_away: false,
            volume_ratio: 3.0,
            filter_score: 0.0,
        }
    }

    #[test]
    fn size_filter_rejects_small_block() {
        let candles = base_window();
        let mut ob = detected(&candles);
        ob.top = 100.3; // size 0.3 < ATR(1.0) × 0.5
        let reason = rejection_reason(&ob, &candles, 1.0, 90.0, &[], &params()).unwrap();
        assert!(reason.contains("too small"));
    }

    #[test]
    fn trend_filter_rejects_close_to_sma() {
        let candles = base_window(); // closes 100.2
        let ob = detected(&candles);
        // SMA at 99: close is on the right side but inside the 2% band
        let reason = rejection_reason(&ob, &candles, 1.0, 99.0, &[], &params()).unwrap();
        assert!(reason.contains("within"));
    }

    #[test]
    fn trend_filter_accepts_clear_distance() {
        let candles = base_window();
        let ob = detected(&candles);
        assert!(rejection_reason(&ob, &candles, 1.0, 90.0, &[], &params()).is_none());
    }

    #[test]
    fn failed_ob_nearby_rejects() {
        let candles = base_window();
        let ob = detected(&candles); // midpoint 101.5, size 3.0
        let failed = [FailedOb { midpoint: 102.0, bar: candles.len() - 5 }];
        let reason = rejection_reason(&ob, &candles, 1.0, 90.0, &failed, &params()).unwrap();
        assert!(reason.contains("failed OB"));
    }

    #[test]
    fn failed_ob_outside_window_ignored() {
        let mut candles = base_window();
        for _ in 0..30 { candles.push(candle(100.0, 100.5, 99.5, 100.2, 100.0)); }
        let ob = detected(&candles);
        let failed = [FailedOb { midpoint: 102.0, bar: 2 }]; // ~58 bars ago
        assert!(rejection_reason(&ob, &candles, 1.0, 90.0, &failed, &params()).is_none());
    }
}
