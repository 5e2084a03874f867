use std::sync::Arc;

use crate::config::{
    StrategyParams, ATR_PCT_RANGEBOUND, ATR_PCT_TRENDING, ATR_PERIOD, FAILED_OB_PRUNE_BARS,
    OB_REPLACE_VOL_RATIO, OB_ZONE_EXIT_BUFFER, TREND_SMA_PERIOD, VOL_AVG_PERIOD, WARMUP_BARS,
};
use crate::filters;
use crate::indicators;
use crate::ob_detector;
use crate::position_manager::{self, ExitAction};
use crate::regime::{self, RegimeCache};
use crate::risk::RiskState;
use crate::types::{Candle, Direction, FailedOb, LimitOrder, OrderBlock, Position, Trade};

/// Per-symbol trade state. The variants make the single-flight invariant
/// structural: a block, a pending order and a position cannot coexist.
#[derive(Clone, Debug)]
pub enum TradeState {
    Idle,
    Active(OrderBlock),
    Pending { ob: OrderBlock, order: LimitOrder },
    Open(Position),
}

impl TradeState {
    pub fn name(&self) -> &'static str {
        match self {
            TradeState::Idle => "IDLE",
            TradeState::Active(_) => "ACTIVE",
            TradeState::Pending { .. } => "LIMIT_PENDING",
            TradeState::Open(_) => "OPEN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelKind {
    TimedOut,
    ZoneExit,
}

/// Telemetry stream: every detection, rejection and lifecycle transition,
/// with rejection reasons as strings rather than errors.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    ObDetected { direction: Direction, top: f64, bottom: f64, volume_ratio: f64 },
    ObRejected { direction: Direction, reason: String },
    ObReplaced { old_volume_ratio: f64, new_volume_ratio: f64 },
    ObInvalidated { reason: String },
    ObMovedAway { direction: Direction, threshold: f64 },
    LimitPlaced { direction: Direction, price: f64 },
    LimitCancelled { kind: CancelKind, reason: String },
    FillDeferred { reason: String },
    PositionOpened { position: Position },
    PartialExit { trade: Trade },
    PositionClosed { trade: Trade },
}

/// Result of one candle's decision pass. Nothing is mutated until `apply`,
/// so a live driver can hold the transition back while it confirms the
/// exchange side, and a backtest applies it unconditionally.
#[derive(Clone, Debug)]
pub struct Transition {
    pub next: TradeState,
    pub events: Vec<EngineEvent>,
}

enum Detection {
    Nothing,
    Rejected { direction: Direction, reason: String },
    Candidate(OrderBlock),
}

/// One symbol's Order-Block engine. Backtest and live both step it one
/// closed candle at a time through the same `decide` path.
pub struct ObEngine {
    symbol: String,
    params: StrategyParams,
    candles: Vec<Candle>,
    state: TradeState,
    failed_obs: Vec<FailedOb>,
    last_exit_bar: Option<usize>,
    regime_cache: Arc<dyn RegimeCache>,
}

impl ObEngine {
    pub fn new(symbol: &str, params: StrategyParams, regime_cache: Arc<dyn RegimeCache>) -> Self {
        ObEngine {
            symbol: symbol.to_string(),
            params,
            candles: Vec::new(),
            state: TradeState::Idle,
            failed_obs: Vec::new(),
            last_exit_bar: None,
            regime_cache,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> &TradeState {
        &self.state
    }

    pub fn bars(&self) -> usize {
        self.candles.len()
    }

    pub fn last_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Append a closed candle. The feed contract (ascending timestamps,
    /// well-formed OHLCV) is asserted in debug builds only.
    pub fn push_candle(&mut self, candle: Candle) {
        debug_assert!(
            candle.open.is_finite()
                && candle.high.is_finite()
                && candle.low.is_finite()
                && candle.close.is_finite()
                && candle.volume.is_finite(),
            "malformed candle from feed"
        );
        if let Some(last) = self.candles.last() {
            debug_assert!(candle.timestamp > last.timestamp, "non-monotonic candle feed");
        }
        self.candles.push(candle);
    }

    /// Convenience for drivers that apply unconditionally (backtest).
    pub fn step(&mut self, candle: Candle, risk: &mut RiskState, capital: f64) -> Vec<EngineEvent> {
        self.push_candle(candle);
        let t = self.decide(risk, capital);
        self.apply(t, risk)
    }

    /// Pure decision pass over the newest candle. Identical for backtest and
    /// live; no engine state is touched.
    pub fn decide(&self, risk: &RiskState, capital: f64) -> Transition {
        let Some(candle) = self.candles.last() else {
            return Transition { next: self.state.clone(), events: Vec::new() };
        };
        let bar = self.candles.len() - 1;

        match &self.state {
            TradeState::Open(pos) => self.decide_open(pos, candle, bar),
            TradeState::Pending { ob, order } => {
                self.decide_pending(ob, order, candle, bar, risk, capital)
            }
            TradeState::Active(ob) => self.decide_active(ob, candle, bar),
            TradeState::Idle => self.decide_idle(bar),
        }
    }

    /// Commit a transition: swap state, update streaks / failed-OB memory /
    /// cooldown from the full-exit events, prune stale memory.
    pub fn apply(&mut self, t: Transition, risk: &mut RiskState) -> Vec<EngineEvent> {
        let bar = self.candles.len().saturating_sub(1);
        for event in &t.events {
            if let EngineEvent::PositionClosed { trade } = event {
                risk.record_result(trade.is_win);
                self.last_exit_bar = Some(bar);
                if !trade.is_win {
                    self.failed_obs.push(FailedOb { midpoint: trade.entry, bar });
                }
            }
        }
        self.failed_obs.retain(|f| bar.saturating_sub(f.bar) <= FAILED_OB_PRUNE_BARS);
        self.state = t.next;
        t.events
    }

    // ── Per-state decisions ──────────────────────────────────────────────────

    fn decide_idle(&self, bar: usize) -> Transition {
        let mut events = Vec::new();

        if self.candles.len() < WARMUP_BARS {
            return Transition { next: TradeState::Idle, events };
        }
        if let Some(last_exit) = self.last_exit_bar {
            if bar.saturating_sub(last_exit) < self.params.reentry_cooldown_bars {
                // Detector skipped entirely during the cooldown
                return Transition { next: TradeState::Idle, events };
            }
        }

        match self.detect_candidate() {
            Detection::Nothing => Transition { next: TradeState::Idle, events },
            Detection::Rejected { direction, reason } => {
                events.push(EngineEvent::ObRejected { direction, reason });
                Transition { next: TradeState::Idle, events }
            }
            Detection::Candidate(ob) => {
                events.push(EngineEvent::ObDetected {
                    direction: ob.direction,
                    top: ob.top,
                    bottom: ob.bottom,
                    volume_ratio: ob.volume_ratio,
                });
                Transition { next: TradeState::Active(ob), events }
            }
        }
    }

    fn decide_active(&self, ob: &OrderBlock, candle: &Candle, bar: usize) -> Transition {
        let mut events = Vec::new();
        let mut ob = ob.clone();
        ob.age += 1;

        if ob.age > self.params.ob_max_bars {
            events.push(EngineEvent::ObInvalidated {
                reason: format!("stale after {} bars", ob.age),
            });
            return Transition { next: TradeState::Idle, events };
        }

        let violated = match ob.direction {
            Direction::Long => candle.close < ob.bottom,
            Direction::Short => candle.close > ob.top,
        };
        if violated {
            events.push(EngineEvent::ObInvalidated {
                reason: format!("close {:.4} through the block boundary", candle.close),
            });
            return Transition { next: TradeState::Idle, events };
        }

        // A stronger breakout may replace the block
        match self.detect_candidate() {
            Detection::Candidate(cand) => {
                if self.params.enable_ob_replacement
                    && cand.volume_ratio >= ob.volume_ratio * OB_REPLACE_VOL_RATIO
                {
                    events.push(EngineEvent::ObReplaced {
                        old_volume_ratio: ob.volume_ratio,
                        new_volume_ratio: cand.volume_ratio,
                    });
                    return Transition { next: TradeState::Active(cand), events };
                }
                events.push(EngineEvent::ObRejected {
                    direction: cand.direction,
                    reason: "active block retained (replacement gate)".to_string(),
                });
            }
            Detection::Rejected { direction, reason } => {
                events.push(EngineEvent::ObRejected { direction, reason });
            }
            Detection::Nothing => {}
        }

        // Departure confirmation, stricter in trending conditions
        let mult = self.min_away_mult();
        let threshold = ob.midpoint() + ob.size() * mult * ob.direction.sign();
        let away = match ob.direction {
            Direction::Long => candle.close > threshold,
            Direction::Short => candle.close < threshold,
        };
        if away {
            ob.moved_away = true;
            let order = LimitOrder {
                direction: ob.direction,
                limit_price: ob.midpoint(),
                created_bar: bar,
                bars_since_touch: 0,
            };
            events.push(EngineEvent::ObMovedAway { direction: ob.direction, threshold });
            events.push(EngineEvent::LimitPlaced {
                direction: order.direction,
                price: order.limit_price,
            });
            return Transition { next: TradeState::Pending { ob, order }, events };
        }

        Transition { next: TradeState::Active(ob), events }
    }

    fn decide_pending(
        &self,
        ob: &OrderBlock,
        order: &LimitOrder,
        candle: &Candle,
        bar: usize,
        risk: &RiskState,
        capital: f64,
    ) -> Transition {
        let mut events = Vec::new();
        let dir = ob.direction;
        let size = ob.size();

        // (a) price left the zone for good
        let zone_exit = match dir {
            Direction::Long => candle.close < ob.bottom - size * OB_ZONE_EXIT_BUFFER,
            Direction::Short => candle.close > ob.top + size * OB_ZONE_EXIT_BUFFER,
        };
        if zone_exit {
            events.push(EngineEvent::LimitCancelled {
                kind: CancelKind::ZoneExit,
                reason: format!("close {:.4} beyond the zone buffer", candle.close),
            });
            return Transition { next: TradeState::Idle, events };
        }

        let touched = candle.low <= order.limit_price && order.limit_price <= candle.high;
        if !touched {
            // (b) patience runs out without a touch
            let mut order = order.clone();
            order.bars_since_touch += 1;
            if order.bars_since_touch >= self.params.order_validity_bars {
                events.push(EngineEvent::LimitCancelled {
                    kind: CancelKind::TimedOut,
                    reason: format!(
                        "no touch within {} bars",
                        self.params.order_validity_bars
                    ),
                });
                return Transition { next: TradeState::Idle, events };
            }
            return Transition { next: TradeState::Pending { ob: ob.clone(), order }, events };
        }

        // A touch renews the order's patience even if the fill is deferred
        let mut order = order.clone();
        order.bars_since_touch = 0;

        // (c) the touching candle must close in the trade's direction
        let reversal = match dir {
            Direction::Long => candle.is_bullish(),
            Direction::Short => candle.close < candle.open,
        };
        if !reversal {
            events.push(EngineEvent::FillDeferred {
                reason: "touch without a reversal candle".to_string(),
            });
            return Transition { next: TradeState::Pending { ob: ob.clone(), order }, events };
        }

        // (d) last look from the filter bank
        if let Err(reason) = filters::prefill(&self.candles, dir, &self.params.filters) {
            events.push(EngineEvent::FillDeferred { reason: format!("prefill: {reason}") });
            return Transition { next: TradeState::Pending { ob: ob.clone(), order }, events };
        }

        let atr = indicators::atr(&self.candles, ATR_PERIOD);
        let margin = risk.margin(capital, &self.params);
        let position = position_manager::plan_fill(
            ob,
            order.limit_price,
            atr,
            margin,
            candle.timestamp,
            bar,
            &self.params,
        );
        events.push(EngineEvent::PositionOpened { position: position.clone() });
        Transition { next: TradeState::Open(position), events }
    }

    fn decide_open(&self, pos: &Position, candle: &Candle, bar: usize) -> Transition {
        let mut events = Vec::new();
        match position_manager::evaluate_exit(pos, candle, bar, &self.params) {
            None => Transition { next: TradeState::Open(pos.clone()), events },
            Some(ExitAction::Partial { price }) => {
                let trade = position_manager::build_trade(
                    pos,
                    price,
                    self.params.tp1_close_pct,
                    candle.timestamp,
                    crate::types::ExitReason::TakeProfit1,
                    &self.params,
                );
                let after = position_manager::apply_partial(pos, &self.params);
                events.push(EngineEvent::PartialExit { trade });
                Transition { next: TradeState::Open(after), events }
            }
            Some(ExitAction::Full { price, reason }) => {
                let trade = position_manager::build_trade(
                    pos,
                    price,
                    pos.remaining_size,
                    candle.timestamp,
                    reason,
                    &self.params,
                );
                events.push(EngineEvent::PositionClosed { trade });
                Transition { next: TradeState::Idle, events }
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn detect_candidate(&self) -> Detection {
        let candles = &self.candles;
        if candles.len() < WARMUP_BARS {
            return Detection::Nothing;
        }
        let atr = indicators::atr(candles, ATR_PERIOD);
        if atr <= 0.0 {
            return Detection::Nothing;
        }
        let vol_avg = indicators::avg_volume(candles, VOL_AVG_PERIOD);
        let Some(trend_sma) = indicators::sma(candles, TREND_SMA_PERIOD) else {
            return Detection::Nothing;
        };
        let Some(mut ob) = ob_detector::detect(candles, atr, vol_avg, trend_sma, &self.params)
        else {
            return Detection::Nothing;
        };

        if let Some(reason) = ob_detector::rejection_reason(
            &ob,
            candles,
            atr,
            trend_sma,
            &self.failed_obs,
            &self.params,
        ) {
            return Detection::Rejected { direction: ob.direction, reason };
        }

        let snapshot = if self.params.filters.regime {
            regime::classify_cached(&*self.regime_cache, &self.symbol, candles)
        } else {
            None
        };
        match filters::evaluate(&ob, candles, snapshot.as_ref(), &self.params.filters) {
            Err(reason) => Detection::Rejected {
                direction: ob.direction,
                reason: format!("filter: {reason}"),
            },
            Ok(passed) => {
                ob.filter_score = passed as f64;
                Detection::Candidate(ob)
            }
        }
    }

    /// Departure multiplier by volatility regime: rangebound markets confirm
    /// quickly, trending ones demand a wider move.
    fn min_away_mult(&self) -> f64 {
        let pct = indicators::atr_pct(&self.candles, ATR_PERIOD);
        if pct < ATR_PCT_RANGEBOUND {
            self.params.min_away_mult_rangebound
        } else if pct > ATR_PCT_TRENDING {
            self.params.min_away_mult_trending
        } else {
            self.params.min_away_mult_normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::InMemoryRegimeCache;

    const STEP_MS: i64 = 15 * 60 * 1000;

    fn candle(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { timestamp: ts, open, high, low, close, volume }
    }

    /// Gentle uptrend with buying pressure: passes the trend and CVD filters
    /// without ever tripping the breakout thresholds (volume ratio stays 1).
    fn warmup_history(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.05;
                candle(i as i64 * STEP_MS, base - 0.45, base + 0.55, base - 0.55, base + 0.45, 100.0)
            })
            .collect()
    }

    fn engine(params: StrategyParams) -> ObEngine {
        ObEngine::new("TESTUSDT", params, Arc::new(InMemoryRegimeCache::new()))
    }

    fn feed(engine: &mut ObEngine, candles: Vec<Candle>, risk: &mut RiskState) -> Vec<EngineEvent> {
        let mut all = Vec::new();
        for c in candles {
            all.extend(engine.step(c, risk, 10_000.0));
        }
        all
    }

    fn next_ts(engine: &ObEngine) -> i64 {
        engine.last_candle().map(|c| c.timestamp + STEP_MS).unwrap_or(0)
    }

    /// Breakout candle relative to the last close: range ≈ 3×ATR, volume 3×,
    /// 90% body, closing well above the long SMA.
    fn breakout_candle(engine: &ObEngine) -> Candle {
        let last = engine.last_candle().unwrap().clone();
        let low = last.close;
        let high = low + 3.3;
        candle(next_ts(engine), low + 0.15, high, low, high - 0.15, 300.0)
    }

    #[test]
    fn no_detection_before_warmup() {
        let mut e = engine(StrategyParams::default());
        let mut risk = RiskState::new();
        let mut candles = warmup_history(400);
        let last = candles.last().unwrap().clone();
        let low = last.close;
        candles.push(candle(last.timestamp + STEP_MS, low + 0.15, low + 3.3, low, low + 3.15, 300.0));
        let events = feed(&mut e, candles, &mut risk);
        assert!(events.is_empty());
        assert!(matches!(e.state(), TradeState::Idle));
    }

    #[test]
    fn breakout_creates_active_block() {
        let mut e = engine(StrategyParams::default());
        let mut risk = RiskState::new();
        feed(&mut e, warmup_history(720), &mut risk);
        let b = breakout_candle(&e);
        let events = feed(&mut e, vec![b.clone()], &mut risk);
        assert!(events.iter().any(|ev| matches!(ev, EngineEvent::ObDetected { direction: Direction::Long, .. })),
            "expected detection, got {events:?}");
        match e.state() {
            TradeState::Active(ob) => {
                assert_eq!(ob.top, b.high);
                assert_eq!(ob.bottom, b.low);
                assert!(!ob.moved_away);
            }
            s => panic!("expected ACTIVE, got {}", s.name()),
        }
    }

    #[test]
    fn block_goes_stale_after_max_bars() {
        let params = StrategyParams { ob_max_bars: 4, ..StrategyParams::default() };
        let mut e = engine(params);
        let mut risk = RiskState::new();
        feed(&mut e, warmup_history(720), &mut risk);
        let b = breakout_candle(&e);
        feed(&mut e, vec![b], &mut risk);

        // Hover inside the block so it never moves away nor violates
        let mid = {
            match e.state() {
                TradeState::Active(ob) => ob.midpoint(),
                _ => unreachable!(),
            }
        };
        let mut events = Vec::new();
        for _ in 0..5 {
            let ts = next_ts(&e);
            events.extend(feed(
                &mut e,
                vec![candle(ts, mid, mid + 0.4, mid - 0.4, mid + 0.1, 100.0)],
                &mut risk,
            ));
        }
        assert!(events.iter().any(|ev| matches!(ev, EngineEvent::ObInvalidated { .. })));
        assert!(matches!(e.state(), TradeState::Idle));
    }

    #[test]
    fn moved_away_places_limit_at_midpoint() {
        let mut e = engine(StrategyParams::default());
        let mut risk = RiskState::new();
        feed(&mut e, warmup_history(720), &mut risk);
        let b = breakout_candle(&e);
        feed(&mut e, vec![b.clone()], &mut risk);

        // Departure clearing both the rangebound and normal multipliers
        let mid = (b.high + b.low) / 2.0;
        let away_close = mid + 3.3 * 0.8 + 0.2;
        let ts = next_ts(&e);
        let events = feed(
            &mut e,
            vec![candle(ts, away_close - 0.3, away_close + 0.2, away_close - 0.5, away_close, 100.0)],
            &mut risk,
        );
        assert!(events.iter().any(|ev| matches!(ev, EngineEvent::ObMovedAway { .. })));
        match e.state() {
            TradeState::Pending { order, .. } => {
                assert!((order.limit_price - mid).abs() < 1e-9);
            }
            s => panic!("expected LIMIT_PENDING, got {}", s.name()),
        }
    }

    #[test]
    fn cooldown_blocks_redetection() {
        let params = StrategyParams { reentry_cooldown_bars: 5, ..StrategyParams::default() };
        let mut e = engine(params);
        let mut risk = RiskState::new();
        feed(&mut e, warmup_history(720), &mut risk);

        // Force the cooldown state directly: a closed trade on this bar
        let bar = e.bars() - 1;
        e.last_exit_bar = Some(bar);

        let b = breakout_candle(&e);
        let events = feed(&mut e, vec![b], &mut risk);
        assert!(events.is_empty(), "detector must be skipped during cooldown");
        assert!(matches!(e.state(), TradeState::Idle));
    }

    #[test]
    fn failed_ob_memory_pruned_after_window() {
        let mut e = engine(StrategyParams::default());
        let mut risk = RiskState::new();
        feed(&mut e, warmup_history(720), &mut risk);
        let bar = e.bars() - 1;
        e.failed_obs.push(FailedOb { midpoint: 100.0, bar });

        // FAILED_OB_PRUNE_BARS quiet candles later the entry is gone
        for _ in 0..=FAILED_OB_PRUNE_BARS {
            let ts = next_ts(&e);
            let base = e.last_candle().unwrap().close;
            e.step(candle(ts, base - 0.45, base + 0.55, base - 0.55, base + 0.05, 100.0), &mut risk, 10_000.0);
        }
        assert!(e.failed_obs.is_empty());
    }
}
