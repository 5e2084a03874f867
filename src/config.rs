// ─── Bybit Demo Account ───────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api-demo.bybit.com";
pub const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
// BYBIT_API_KEY, BYBIT_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime (see .env.example)

// ─── Account ──────────────────────────────────────────────────────────────────
pub const ACCOUNT_CAPITAL: f64 = 10_000.0;
pub const MAX_DAILY_LOSS_PCT: f64 = 0.05; // 5 %
pub const EQUITY_FLOOR_PCT: f64 = 0.90;   // 90 %

/// Hardcoded pairs used when USE_ALL_PAIRS = false.
pub const TRADING_PAIRS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT"];
pub const MAX_OPEN_POSITIONS: usize = 3;

/// If true, bot fetches the full list of active USDT linear perpetuals from Bybit at startup
/// and scans all of them. If false, uses only TRADING_PAIRS above.
pub const USE_ALL_PAIRS: bool = false;

/// Kline timeframe (minutes) the engine runs on. Una sola TF: la estrategia ORB
/// no usa cascada multi-timeframe.
pub const KLINE_INTERVAL: &str = "15";

// ─── Indicator periods ────────────────────────────────────────────────────────
pub const ATR_PERIOD: usize = 14;
pub const VOL_AVG_PERIOD: usize = 50;
/// Higher-timeframe trend proxy: SMA(600) on the working TF.
pub const TREND_SMA_PERIOD: usize = 600;
/// Candles required before the first detection decision.
pub const WARMUP_BARS: usize = 700;

// ─── Order Block geometry ─────────────────────────────────────────────────────
/// Minimum block size as a multiple of ATR ("OB too small" rejection).
pub const OB_MIN_SIZE_ATR: f64 = 0.5;
/// A replacement candidate must beat the active block's volume ratio by this much.
pub const OB_REPLACE_VOL_RATIO: f64 = 1.5;
/// Zone-exit buffer while a limit order is pending, as a fraction of OB size.
pub const OB_ZONE_EXIT_BUFFER: f64 = 0.5;

// ─── Trend filter (long SMA) ──────────────────────────────────────────────────
/// Price must clear the long SMA by this fraction on the block's side.
pub const TREND_MIN_SMA_DIST: f64 = 0.02;
/// Bars over which the SMA slope is measured.
pub const TREND_SLOPE_BARS: usize = 20;
/// At least this many of the last TREND_SLOPE_BARS closes must sit on the
/// required side of the SMA (sustained trend, not a single spike).
pub const TREND_MIN_SIDE_BARS: usize = 10;

// ─── Failed-OB memory ─────────────────────────────────────────────────────────
/// Entries older than this many bars are pruned.
pub const FAILED_OB_PRUNE_BARS: usize = 50;
/// Only entries recorded within this many bars reject a new candidate.
pub const FAILED_OB_WINDOW_BARS: usize = 20;

// ─── Moved-away confirmation (regime-dependent) ───────────────────────────────
/// ATR% breakpoints separating rangebound / normal / trending behaviour.
pub const ATR_PCT_RANGEBOUND: f64 = 1.0;
pub const ATR_PCT_TRENDING: f64 = 2.0;

// ─── Market regime cache ──────────────────────────────────────────────────────
pub const REGIME_CACHE_TTL_MS: i64 = 15 * 60 * 1000;

// ─── Parámetros por símbolo (resultado del grid search sobre 2 años 15M) ──────
//
//            Symbol  ATR×  Vol×  Body  TP1×  RR    Hold
//           BTCUSDT  1.5   2.0   0.60  1.0   2.0    48
//           ETHUSDT  1.5   1.8   0.55  1.0   2.5    48
//           SOLUSDT  1.8   2.2   0.60  1.2   2.0    32

#[derive(Clone, Debug)]
pub struct StrategyParams {
    // Breakout sensitivity
    pub orb_atr_mult:   f64,   // rango mínimo de la vela breakout como múltiplo del ATR
    pub orb_vol_mult:   f64,   // multiplicador de volumen mínimo vs media de 50
    pub min_body_ratio: f64,   // |close-open| / (high-low) mínimo

    // Block staleness / confirmation
    pub ob_max_bars:              usize, // velas máximas de vida de un bloque sin retest
    pub min_away_mult_rangebound: f64,   // ATR% < 1.0
    pub min_away_mult_normal:     f64,
    pub min_away_mult_trending:   f64,   // ATR% > 2.0
    pub order_validity_bars:      usize, // paciencia de la orden límite

    // Risk geometry
    pub sl_buffer_pct:     f64, // colchón del SL más allá del borde del bloque
    pub tp1_ratio:         f64, // TP1 = entry + risk × tp1_ratio
    pub reward_risk_ratio: f64, // TP2 = entry + risk × reward_risk_ratio
    pub tp1_close_pct:     f64, // fracción cerrada en TP1 (1.0 = salida completa)
    pub enable_risk_cap:   bool,
    pub max_risk_atr:      f64, // cap del stop a ATR × este múltiplo (solo encoge)

    // Time management
    pub max_holding_bars:      usize,
    pub reentry_cooldown_bars: usize,

    // Replacement
    pub enable_ob_replacement: bool,

    // Costs
    pub leverage:     f64,
    pub maker_fee:    f64,
    pub taker_fee:    f64,
    pub slippage_pct: f64, // maker-side fill slippage, in the block's direction

    // Capital sizing
    pub capital_fraction: f64,
    pub min_margin:       f64,
    pub max_margin:       f64,

    // Exchange precision (Bybit lotSize / tickSize)
    pub qty_step:  f64,
    pub tick_size: f64,

    pub filters: FilterParams,
}

#[derive(Clone, Debug)]
pub struct FilterParams {
    pub atr_range:   bool,
    pub atr_min_pct: f64,
    pub atr_max_pct: f64,

    pub cvd:            bool,
    pub cvd_lookback:   usize, // window for the running delta
    pub cvd_trend_bars: usize, // delta trend measured over the most recent N bars

    pub bos:          bool,
    pub bos_lookback: usize,

    pub sweep:          bool,
    pub sweep_lookback: usize,

    pub ema_align: bool,

    pub fvg:             bool,
    pub fvg_min_gap_pct: f64,
    pub fvg_lookback:    usize,

    pub adx:           AdxFilterMode,
    pub adx_threshold: f64,

    pub rsi:            RsiFilterMode,
    pub rsi_overbought: f64,
    pub rsi_oversold:   f64,

    pub regime:                bool,
    pub regime_required:       Option<crate::regime::Regime>, // None = any regime, confidence-gated
    pub regime_min_confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdxFilterMode {
    Off,
    /// Require ADX ≥ threshold.
    Strong,
    /// Require ADX < threshold.
    Weak,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RsiFilterMode {
    Off,
    /// Reject entries at an extreme reading (overbought long / oversold short).
    Filter,
    /// Require the extreme reading instead (mean-reversion entries).
    Contrarian,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            atr_range:   true,
            atr_min_pct: 0.4,
            atr_max_pct: 3.0,
            cvd:            true,
            cvd_lookback:   50,
            cvd_trend_bars: 10,
            bos:          false,
            bos_lookback: 30,
            sweep:          false,
            sweep_lookback: 10,
            ema_align: false,
            fvg:             false,
            fvg_min_gap_pct: 0.001,
            fvg_lookback:    20,
            adx:           AdxFilterMode::Off,
            adx_threshold: 25.0,
            rsi:            RsiFilterMode::Off,
            rsi_overbought: 70.0,
            rsi_oversold:   30.0,
            regime:                false,
            regime_required:       None,
            regime_min_confidence: 40.0,
        }
    }
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams {
            orb_atr_mult:   1.5,
            orb_vol_mult:   2.0,
            min_body_ratio: 0.6,
            ob_max_bars:              20,
            min_away_mult_rangebound: 0.5,
            min_away_mult_normal:     0.8,
            min_away_mult_trending:   1.2,
            order_validity_bars:      3,
            sl_buffer_pct:     0.005,
            tp1_ratio:         1.0,
            reward_risk_ratio: 2.0,
            tp1_close_pct:     0.8,
            enable_risk_cap:   true,
            max_risk_atr:      2.0,
            max_holding_bars:      48,
            reentry_cooldown_bars: 5,
            enable_ob_replacement: true,
            leverage:     3.0,
            maker_fee:    0.0002,
            taker_fee:    0.00055,
            slippage_pct: 0.0005,
            capital_fraction: 0.10,
            min_margin:       10.0,
            max_margin:       500.0,
            qty_step:  1.0,
            tick_size: 0.01,
            filters: FilterParams::default(),
        }
    }
}

pub fn symbol_params(symbol: &str) -> StrategyParams {
    let base = StrategyParams::default();
    match symbol {
        "BTCUSDT" => StrategyParams { qty_step: 0.001, tick_size: 0.1, ..base },
        "ETHUSDT" => StrategyParams {
            orb_vol_mult: 1.8,
            min_body_ratio: 0.55,
            reward_risk_ratio: 2.5,
            qty_step: 0.01,
            tick_size: 0.01,
            ..base
        },
        "SOLUSDT" => StrategyParams {
            orb_atr_mult: 1.8,
            orb_vol_mult: 2.2,
            tp1_ratio: 1.2,
            max_holding_bars: 32,
            qty_step: 0.1,
            tick_size: 0.001,
            ..base
        },
        "BNBUSDT" => StrategyParams { qty_step: 0.01, tick_size: 0.01, ..base },
        "XRPUSDT" => StrategyParams { qty_step: 1.0, tick_size: 0.0001, ..base },
        _ => base,
    }
}

/// Decimal places implied by a tick size (0.001 → 3). Used when formatting
/// prices for the exchange.
pub fn tick_decimals(tick_size: f64) -> usize {
    if tick_size <= 0.0 { return 2; }
    let mut d = 0usize;
    let mut t = tick_size;
    while t < 0.999_999 && d < 8 {
        t *= 10.0;
        d += 1;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_decimals_common_sizes() {
        assert_eq!(tick_decimals(0.1), 1);
        assert_eq!(tick_decimals(0.01), 2);
        assert_eq!(tick_decimals(0.0001), 4);
        assert_eq!(tick_decimals(1.0), 0);
    }

    #[test]
    fn symbol_overrides_keep_defaults() {
        let p = symbol_params("ETHUSDT");
        assert_eq!(p.orb_vol_mult, 1.8);
        assert_eq!(p.order_validity_bars, 3); // untouched by the override
    }
}
