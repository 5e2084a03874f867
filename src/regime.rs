use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::{ATR_PERIOD, REGIME_CACHE_TTL_MS};
use crate::indicators;
use crate::types::Candle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Ranging,
    Trending,
    Volatile,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Ranging => "RANGING",
            Regime::Trending => "TRENDING",
            Regime::Volatile => "VOLATILE",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MarketRegime {
    pub regime: Regime,
    pub confidence: f64, // 0–100
    pub adx: f64,
    pub atr_pct: f64,
    pub bb_width_pct: f64,
    pub computed_at: i64, // ms, candle time
}

// Metric weights (ADX 40%, ATR% 30%, BB width% 30%) and bucket breakpoints.
const W_ADX: f64 = 40.0;
const W_ATR: f64 = 30.0;
const W_BB: f64 = 30.0;
const ADX_TRENDING: f64 = 25.0;
const ATR_PCT_VOLATILE: f64 = 2.0;
const ATR_PCT_RANGING: f64 = 0.8;
const BB_WIDTH_VOLATILE: f64 = 5.0;
const BB_WIDTH_RANGING: f64 = 2.0;

const BB_PERIOD: usize = 20;
const BB_SIGMA: f64 = 2.0;

/// Injected cache capability so the classifier is testable without a real
/// backend. Expiry is judged against candle time, keeping backtests
/// deterministic.
pub trait RegimeCache: Send + Sync {
    fn get(&self, symbol: &str) -> Option<MarketRegime>;
    fn put(&self, symbol: &str, snapshot: MarketRegime);
}

#[derive(Default)]
pub struct InMemoryRegimeCache {
    entries: Mutex<HashMap<String, MarketRegime>>,
}

impl InMemoryRegimeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegimeCache for InMemoryRegimeCache {
    fn get(&self, symbol: &str) -> Option<MarketRegime> {
        self.entries.lock().unwrap().get(symbol).copied()
    }

    fn put(&self, symbol: &str, snapshot: MarketRegime) {
        self.entries.lock().unwrap().insert(symbol.to_string(), snapshot);
    }
}

/// Classify the current market regime from ADX(14), ATR% and BB width%.
/// Each metric votes one bucket with its full weight; the winning bucket's
/// score is the confidence. None while indicators are warming up.
pub fn classify(candles: &[Candle]) -> Option<MarketRegime> {
    let last = candles.last()?;
    let adx = indicators::adx(candles, ATR_PERIOD)?;
    let atr_pct = indicators::atr_pct(candles, ATR_PERIOD);
    if atr_pct <= 0.0 { return None; }
    let bb = indicators::bollinger_bands(candles, BB_PERIOD, BB_SIGMA)?;
    let bb_width_pct = bb.width_pct();

    let mut ranging = 0.0;
    let mut trending = 0.0;
    let mut volatile = 0.0;

    if adx >= ADX_TRENDING { trending += W_ADX; } else { ranging += W_ADX; }

    if atr_pct >= ATR_PCT_VOLATILE {
        volatile += W_ATR;
    } else if atr_pct < ATR_PCT_RANGING {
        ranging += W_ATR;
    } else {
        trending += W_ATR;
    }

    if bb_width_pct >= BB_WIDTH_VOLATILE {
        volatile += W_BB;
    } else if bb_width_pct < BB_WIDTH_RANGING {
        ranging += W_BB;
    } else {
        trending += W_BB;
    }

    // First strictly-greater bucket wins; ties resolve in declaration order.
    let mut regime = Regime::Ranging;
    let mut score = ranging;
    if trending > score {
        regime = Regime::Trending;
        score = trending;
    }
    if volatile > score {
        regime = Regime::Volatile;
        score = volatile;
    }

    Some(MarketRegime {
        regime,
        confidence: score.min(100.0),
        adx,
        atr_pct,
        bb_width_pct,
        computed_at: last.timestamp,
    })
}

/// Cached classification keyed by symbol with a 15-minute TTL measured in
/// candle time.
pub fn classify_cached(
    cache: &dyn RegimeCache,
    symbol: &str,
    candles: &[Candle],
) -> Option<MarketRegime> {
    let now = candles.last()?.timestamp;
    if let Some(hit) = cache.get(symbol) {
        if now - hit.computed_at < REGIME_CACHE_TTL_MS {
            return Some(hit);
        }
    }
    let fresh = classify(candles)?;
    cache.put(symbol, fresh);
    Some(fresh)
}
