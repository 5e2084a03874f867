use crate::indicators;
use crate::types::{Candle, Direction};

/// Bars required on each side of a swing extreme before it is confirmed.
const SWING_STRENGTH: usize = 2;

/// Most recent confirmed swing high within `lookback` bars: strictly higher
/// than SWING_STRENGTH neighbours on both sides.
pub fn latest_swing_high(candles: &[Candle], lookback: usize) -> Option<(usize, f64)> {
    let n = candles.len();
    if n < 2 * SWING_STRENGTH + 1 { return None; }
    let newest = n - 1 - SWING_STRENGTH;
    let oldest = n.saturating_sub(lookback).max(SWING_STRENGTH);

    for s in (oldest..=newest).rev() {
        let h = candles[s].high;
        let left_ok = candles[s - SWING_STRENGTH..s].iter().all(|c| c.high < h);
        let right_ok = candles[s + 1..=s + SWING_STRENGTH].iter().all(|c| c.high < h);
        if left_ok && right_ok {
            return Some((s, h));
        }
    }
    None
}

pub fn latest_swing_low(candles: &[Candle], lookback: usize) -> Option<(usize, f64)> {
    let n = candles.len();
    if n < 2 * SWING_STRENGTH + 1 { return None; }
    let newest = n - 1 - SWING_STRENGTH;
    let oldest = n.saturating_sub(lookback).max(SWING_STRENGTH);

    for s in (oldest..=newest).rev() {
        let l = candles[s].low;
        let left_ok = candles[s - SWING_STRENGTH..s].iter().all(|c| c.low > l);
        let right_ok = candles[s + 1..=s + SWING_STRENGTH].iter().all(|c| c.low > l);
        if left_ok && right_ok {
            return Some((s, l));
        }
    }
    None
}

/// Break of structure: some close beyond the most recent confirmed swing
/// extreme after that swing formed.
pub fn break_of_structure(candles: &[Candle], direction: Direction, lookback: usize) -> bool {
    let n = candles.len();
    match direction {
        Direction::Long => {
            let Some((s, level)) = latest_swing_high(candles, lookback) else { return false; };
            candles[s + SWING_STRENGTH + 1..n].iter().any(|c| c.close > level)
        }
        Direction::Short => {
            let Some((s, level)) = latest_swing_low(candles, lookback) else { return false; };
            candles[s + SWING_STRENGTH + 1..n].iter().any(|c| c.close < level)
        }
    }
}

/// Liquidity sweep: within the last `recent` bars a wick pierced the nearest
/// prior swing extreme and the candle closed back on the correct side of it.
pub fn liquidity_sweep(candles: &[Candle], direction: Direction, recent: usize) -> bool {
    let n = candles.len();
    if n == 0 { return false; }
    let window_start = n.saturating_sub(recent);
    match direction {
        Direction::Long => {
            // Stop-hunt below a swing low before the move up
            let Some((s, level)) = latest_swing_low(candles, n) else { return false; };
            let from = (s + SWING_STRENGTH + 1).max(window_start).min(n);
            candles[from..].iter().any(|c| c.low < level && c.close > level)
        }
        Direction::Short => {
            let Some((s, level)) = latest_swing_high(candles, n) else { return false; };
            let from = (s + SWING_STRENGTH + 1).max(window_start).min(n);
            candles[from..].iter().any(|c| c.high > level && c.close < level)
        }
    }
}

/// Short/medium/long EMAs (8/21/55) fully ordered in the trade's direction.
pub fn ema_alignment(candles: &[Candle], direction: Direction) -> bool {
    let (Some(fast), Some(mid), Some(slow)) = (
        indicators::ema(candles, 8),
        indicators::ema(candles, 21),
        indicators::ema(candles, 55),
    ) else {
        return false;
    };
    match direction {
        Direction::Long => fast > mid && mid > slow,
        Direction::Short => fast < mid && mid < slow,
    }
}

/// Detecta un FVG con el patrón 3-velas (válido para futuros perpetuos).
///
/// Bullish FVG: c3.low > c1.high  →  zona = [c1.high, c3.low]
/// Bearish FVG: c1.low > c3.high  →  zona = [c3.high, c1.low]
/// c2 es la vela impulso y debe cerrar en la dirección del gap.
pub fn find_fvg(
    candles: &[Candle],
    direction: Direction,
    min_gap_pct: f64,
    lookback: usize,
) -> Option<(f64, f64)> {
    let n = candles.len();
    if n < 3 { return None; }
    let search_start = n.saturating_sub(lookback + 2);

    for j in (search_start..n - 2).rev() {
        let c1 = &candles[j];
        let c2 = &candles[j + 1]; // impulso
        let c3 = &candles[j + 2];

        match direction {
            Direction::Long => {
                if c3.low > c1.high {
                    let gap = c3.low - c1.high;
                    if gap > c2.close * min_gap_pct && c2.is_bullish() {
                        return Some((c1.high, c3.low));
                    }
                }
            }
            Direction::Short => {
                if c1.low > c3.high {
                    let gap = c1.low - c3.high;
                    if gap > c2.close * min_gap_pct && !c2.is_bullish() {
                        return Some((c3.high, c1.low));
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume: 100.0 }
    }

    fn flat(n: usize, price: f64) -> Vec<Candle> {
        (0..n).map(|_| candle(price, price + 0.5, price - 0.5, price)).collect()
    }

    #[test]
    fn swing_high_confirmed_after_two_bars() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 110.0, 99.0, 105.0)); // the swing
        candles.extend(flat(2, 100.0));
        let (idx, level) = latest_swing_high(&candles, 20).unwrap();
        assert_eq!(idx, 5);
        assert_eq!(level, 110.0);
    }

    #[test]
    fn swing_high_not_confirmed_without_right_bars() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 110.0, 99.0, 105.0));
        candles.extend(flat(1, 100.0)); // only one bar after — unconfirmed
        assert!(latest_swing_high(&candles, 20).is_none());
    }

    #[test]
    fn bos_long_requires_close_beyond_swing_high() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 110.0, 99.0, 105.0));
        candles.extend(flat(3, 100.0));
        assert!(!break_of_structure(&candles, Direction::Long, 20));

        candles.push(candle(100.0, 112.0, 100.0, 111.0)); // close through 110
        assert!(break_of_structure(&candles, Direction::Long, 20));
    }

    #[test]
    fn sweep_long_wick_below_swing_low_closing_back() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 101.0, 90.0, 100.0)); // swing low at 90
        candles.extend(flat(3, 100.0));
        // Wick pierces 90 but closes back above
        candles.push(candle(100.0, 101.0, 88.0, 99.0));
        assert!(liquidity_sweep(&candles, Direction::Long, 5));
    }

    #[test]
    fn sweep_long_fails_when_close_stays_below() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 101.0, 90.0, 100.0));
        candles.extend(flat(3, 100.0));
        candles.push(candle(100.0, 101.0, 88.0, 89.0)); // closes below the level
        assert!(!liquidity_sweep(&candles, Direction::Long, 5));
    }

    #[test]
    fn ema_alignment_in_sustained_uptrend() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 0.5, base - 0.5, base + 0.3)
            })
            .collect();
        assert!(ema_alignment(&candles, Direction::Long));
        assert!(!ema_alignment(&candles, Direction::Short));
    }

    #[test]
    fn fvg_bullish_three_candle_gap() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 101.0, 99.0, 100.5)); // c1, high = 101
        candles.push(candle(101.0, 106.0, 100.5, 105.5)); // c2 impulse, bullish
        candles.push(candle(105.0, 107.0, 103.0, 106.0)); // c3, low = 103 > 101
        let (lo, hi) = find_fvg(&candles, Direction::Long, 0.001, 10).unwrap();
        assert_eq!(lo, 101.0);
        assert_eq!(hi, 103.0);
    }

    #[test]
    fn fvg_rejects_gap_below_min_pct() {
        let mut candles = flat(5, 100.0);
        candles.push(candle(100.0, 101.0, 99.0, 100.5));
        candles.push(candle(101.0, 106.0, 100.5, 105.5));
        candles.push(candle(105.0, 107.0, 101.01, 106.0)); // gap of 0.01
        assert!(find_fvg(&candles, Direction::Long, 0.001, 10).is_none());
    }
}
