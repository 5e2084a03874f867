use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64, // ms
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// |close-open| / (high-low), 0.0 on a zero-range candle.
    pub fn body_ratio(&self) -> f64 {
        let range = self.range();
        if range <= 0.0 { return 0.0; }
        (self.close - self.open).abs() / range
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for Long, -1.0 for Short. Multiplying a price move by this gives
    /// signed PnL per unit.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "Long",
            Direction::Short => "Short",
        }
    }

    /// Bybit order side for an entry in this direction.
    pub fn order_side(&self) -> &'static str {
        match self {
            Direction::Long => "Buy",
            Direction::Short => "Sell",
        }
    }
}

/// A breakout candle's range held as a support/resistance zone for a
/// midpoint-retest entry. Invariant: top ≥ bottom.
#[derive(Clone, Debug)]
pub struct OrderBlock {
    pub direction: Direction,
    pub top: f64,
    pub bottom: f64,
    pub method: &'static str, // "ORB"
    pub detected_bar: usize,
    pub age: usize,
    pub moved_away: bool,
    /// Breakout-candle volume over the 50-bar average, kept for the
    /// replacement policy.
    pub volume_ratio: f64,
    /// Fraction of enabled entry filters that passed (diagnostics only).
    pub filter_score: f64,
}

impl OrderBlock {
    pub fn midpoint(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    pub fn size(&self) -> f64 {
        self.top - self.bottom
    }
}

/// Retest entry order at the block midpoint. At most one per symbol, and only
/// while its block is moved-away with no open position.
#[derive(Clone, Debug)]
pub struct LimitOrder {
    pub direction: Direction,
    pub limit_price: f64,
    pub created_bar: usize,
    /// Candles since creation or since the last touch of the limit price.
    /// A touch renews the order's patience.
    pub bars_since_touch: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Position {
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub entry_time: i64,
    pub entry_bar: usize,
    pub margin: f64,
    pub qty: f64,
    /// Remaining fraction of the original size, in (0, 1].
    pub remaining_size: f64,
    pub partial_exit_done: bool,
    pub method: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit1,
    TakeProfit2,
    StopLoss,
    TimeStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit1 => "TP1",
            ExitReason::TakeProfit2 => "TP2",
            ExitReason::StopLoss => "SL",
            ExitReason::TimeStop => "TimeStop",
        }
    }
}

/// Immutable record of a (partial or full) exit. One or two per position.
#[derive(Clone, Debug, Serialize)]
pub struct Trade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub direction: Direction,
    pub entry: f64,
    pub exit: f64,
    pub size: f64, // qty closed by this exit
    pub fees: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub is_win: bool,
    pub method: &'static str,
    pub reason: ExitReason,
}

/// Midpoint of a recently-lost block; new candidates retesting one are
/// rejected for FAILED_OB_WINDOW_BARS.
#[derive(Clone, Copy, Debug)]
pub struct FailedOb {
    pub midpoint: f64,
    pub bar: usize,
}
