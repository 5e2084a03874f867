use crate::types::Candle;

/// ATR as the simple mean of the true range over the last `period` candles.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < period + 1 { return 0.0; }
    let start = candles.len() - period - 1;
    ((start + 1)..candles.len()).map(|i| {
        let c = &candles[i];
        let p = &candles[i - 1];
        (c.high - c.low).max((c.high - p.close).abs()).max((c.low - p.close).abs())
    }).sum::<f64>() / period as f64
}

/// ATR as a percentage of the last close. 0.0 when unavailable.
pub fn atr_pct(candles: &[Candle], period: usize) -> f64 {
    let a = atr(candles, period);
    match candles.last() {
        Some(c) if c.close > 0.0 => a / c.close * 100.0,
        _ => 0.0,
    }
}

pub fn avg_volume(candles: &[Candle], period: usize) -> f64 {
    let n = candles.len().min(period);
    if n == 0 { return 0.0; }
    candles.iter().rev().take(n).map(|c| c.volume).sum::<f64>() / n as f64
}

/// SMA of closes over the last `period` candles.
pub fn sma(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period || period == 0 { return None; }
    let sum: f64 = candles.iter().rev().take(period).map(|c| c.close).sum();
    Some(sum / period as f64)
}

/// EMA of closes, seeded with the SMA of the first `period` values.
pub fn ema(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period || period == 0 { return None; }
    let seed: f64 = candles[..period].iter().map(|c| c.close).sum::<f64>() / period as f64;
    let k = 2.0 / (period as f64 + 1.0);
    let mut e = seed;
    for c in &candles[period..] {
        e = (c.close - e) * k + e;
    }
    Some(e)
}

/// RSI with Wilder smoothing.
pub fn rsi(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 || period == 0 { return None; }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = candles[i].close - candles[i - 1].close;
        if change > 0.0 { avg_gain += change; } else { avg_loss -= change; }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in (period + 1)..candles.len() {
        let change = candles[i].close - candles[i - 1].close;
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 { return Some(100.0); }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// ADX(period) with Wilder smoothing. Needs at least 2×period+1 candles.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    let n = candles.len();
    if period == 0 || n < 2 * period + 1 { return None; }

    let mut sm_tr = 0.0;
    let mut sm_pdm = 0.0;
    let mut sm_ndm = 0.0;
    let mut adx_acc = 0.0;
    let mut dx_count = 0usize;
    let mut adx_val = 0.0;

    for i in 1..n {
        let c = &candles[i];
        let p = &candles[i - 1];
        let tr = (c.high - c.low)
            .max((c.high - p.close).abs())
            .max((c.low - p.close).abs());
        let up = c.high - p.high;
        let down = p.low - c.low;
        let pdm = if up > down && up > 0.0 { up } else { 0.0 };
        let ndm = if down > up && down > 0.0 { down } else { 0.0 };

        if i <= period {
            sm_tr += tr;
            sm_pdm += pdm;
            sm_ndm += ndm;
            if i < period { continue; }
        } else {
            sm_tr = sm_tr - sm_tr / period as f64 + tr;
            sm_pdm = sm_pdm - sm_pdm / period as f64 + pdm;
            sm_ndm = sm_ndm - sm_ndm / period as f64 + ndm;
        }

        if sm_tr <= 0.0 { continue; }
        let di_plus = 100.0 * sm_pdm / sm_tr;
        let di_minus = 100.0 * sm_ndm / sm_tr;
        let di_sum = di_plus + di_minus;
        if di_sum <= 0.0 { continue; }
        let dx = 100.0 * (di_plus - di_minus).abs() / di_sum;

        dx_count += 1;
        if dx_count <= period {
            adx_acc += dx;
            adx_val = adx_acc / dx_count as f64;
        } else {
            adx_val = (adx_val * (period as f64 - 1.0) + dx) / period as f64;
        }
    }

    if dx_count == 0 { return None; }
    Some(adx_val)
}

#[derive(Clone, Copy, Debug)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    /// Band width as a percentage of the middle band.
    pub fn width_pct(&self) -> f64 {
        if self.middle <= 0.0 { return 0.0; }
        (self.upper - self.lower) / self.middle * 100.0
    }
}

/// Bollinger Bands (period, k·σ) over closes.
pub fn bollinger_bands(candles: &[Candle], period: usize, k: f64) -> Option<BollingerBands> {
    if candles.len() < period || period == 0 { return None; }
    let closes: Vec<f64> = candles.iter().rev().take(period).map(|c| c.close).collect();
    let mean = closes.iter().sum::<f64>() / period as f64;
    let var = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    Some(BollingerBands {
        upper: mean + k * sd,
        middle: mean,
        lower: mean - k * sd,
    })
}

/// Cumulative volume delta approximated from OHLCV: each candle's volume is
/// split into buy/sell pressure by where the close sits in the range.
/// Returns the running delta over the last `lookback` candles (oldest first).
pub fn cvd_series(candles: &[Candle], lookback: usize) -> Vec<f64> {
    let n = candles.len().min(lookback);
    let window = &candles[candles.len() - n..];
    let mut out = Vec::with_capacity(n);
    let mut cum = 0.0;
    for c in window {
        let range = c.range();
        if range > 0.0 {
            // buy = (close-low)/range, sell = (high-close)/range → delta below
            cum += c.volume * (2.0 * c.close - c.high - c.low) / range;
        }
        out.push(cum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume }
    }

    fn flat_series(n: usize, price: f64) -> Vec<Candle> {
        (0..n).map(|_| candle(price, price + 1.0, price - 1.0, price, 100.0)).collect()
    }

    #[test]
    fn atr_simple_average_of_true_range() {
        // Constant 2.0 range, no gaps → ATR = 2.0
        let candles = flat_series(20, 100.0);
        assert!((atr(&candles, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_counts_gaps() {
        let mut candles = flat_series(5, 100.0);
        // Gap up: prev close 100, this low 108 → TR = high - prev_close = 12
        candles.push(candle(110.0, 112.0, 108.0, 111.0, 100.0));
        let a = atr(&candles, 5);
        // Four TRs of 2.0 and one of 12.0
        assert!((a - (2.0 * 4.0 + 12.0) / 5.0).abs() < 1e-9);
    }

    #[test]
    fn atr_insufficient_data_is_zero() {
        let candles = flat_series(5, 100.0);
        assert_eq!(atr(&candles, 14), 0.0);
    }

    #[test]
    fn sma_and_ema_on_constant_series() {
        let candles = flat_series(30, 50.0);
        assert!((sma(&candles, 10).unwrap() - 50.0).abs() < 1e-9);
        assert!((ema(&candles, 10).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(100.0 + i as f64, 101.0 + i as f64, 99.0 + i as f64, 100.5 + i as f64, 10.0))
            .collect();
        assert!((rsi(&candles, 14).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_flat_series_has_no_momentum() {
        let candles = flat_series(30, 100.0);
        // No gains, no losses → avg_loss == 0 → RSI pegged at 100 by convention
        assert_eq!(rsi(&candles, 14), Some(100.0));
    }

    #[test]
    fn adx_strong_uptrend_reads_high() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0, 10.0)
            })
            .collect();
        let v = adx(&candles, 14).unwrap();
        assert!(v > 40.0, "uptrend ADX should be high, got {v}");
    }

    #[test]
    fn adx_needs_warmup() {
        let candles = flat_series(20, 100.0);
        assert!(adx(&candles, 14).is_none());
    }

    #[test]
    fn bollinger_constant_series_collapses() {
        let candles = flat_series(25, 100.0);
        let bb = bollinger_bands(&candles, 20, 2.0).unwrap();
        assert!((bb.upper - 100.0).abs() < 1e-9);
        assert!((bb.lower - 100.0).abs() < 1e-9);
        assert_eq!(bb.width_pct(), 0.0);
    }

    #[test]
    fn cvd_close_at_high_accumulates_positive() {
        // close == high on every candle → full volume counted as buying
        let candles: Vec<Candle> = (0..10)
            .map(|_| candle(100.0, 102.0, 98.0, 102.0, 50.0))
            .collect();
        let series = cvd_series(&candles, 10);
        assert_eq!(series.len(), 10);
        assert!((series[9] - 500.0).abs() < 1e-9);
        assert!(series.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn cvd_zero_range_candle_contributes_nothing() {
        let candles = vec![candle(100.0, 100.0, 100.0, 100.0, 1_000.0)];
        let series = cvd_series(&candles, 10);
        assert_eq!(series, vec![0.0]);
    }
}
