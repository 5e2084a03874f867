use crate::config::StrategyParams;
use crate::types::{Candle, Direction, ExitReason, OrderBlock, Position, Trade};

const MIN_ORDER_NOTIONAL: f64 = 100.0; // Bybit minimum order value in USDT

/// What the exit scan decided for this candle, if anything.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitAction {
    /// TP1 partial: close `tp1_close_pct` of the position at this price and
    /// move the stop to breakeven.
    Partial { price: f64 },
    Full { price: f64, reason: ExitReason },
}

/// Build the Position created by a limit-order fill at the block midpoint.
///
/// Entry carries maker-side slippage in the block's direction; the stop sits
/// a fixed buffer beyond the block boundary, optionally capped at
/// ATR × max_risk_atr (the cap only ever shrinks the stop distance).
pub fn plan_fill(
    ob: &OrderBlock,
    limit_price: f64,
    atr: f64,
    margin: f64,
    entry_time: i64,
    entry_bar: usize,
    p: &StrategyParams,
) -> Position {
    let dir = ob.direction;
    let entry = limit_price * (1.0 + p.slippage_pct * dir.sign());

    let mut stop_loss = match dir {
        Direction::Long => ob.bottom * (1.0 - p.sl_buffer_pct),
        Direction::Short => ob.top * (1.0 + p.sl_buffer_pct),
    };
    if p.enable_risk_cap && atr > 0.0 {
        let cap = atr * p.max_risk_atr;
        if (entry - stop_loss).abs() > cap {
            stop_loss = entry - cap * dir.sign();
        }
    }

    let risk = (entry - stop_loss).abs();
    let take_profit_1 = entry + risk * p.tp1_ratio * dir.sign();
    let take_profit_2 = entry + risk * p.reward_risk_ratio * dir.sign();
    let qty = if entry > 0.0 { margin * p.leverage / entry } else { 0.0 };

    Position {
        direction: dir,
        entry,
        stop_loss,
        take_profit_1,
        take_profit_2,
        entry_time,
        entry_bar,
        margin,
        qty,
        remaining_size: 1.0,
        partial_exit_done: false,
        method: ob.method,
    }
}

/// Scan one candle for an exit, in priority order: TP1 → TP2/SL → time stop
/// at the candle open. Same-candle conflicts between a profit target and the
/// stop are resolved by proximity to the open; once TP1 fires, TP2/SL are not
/// also checked on that candle.
pub fn evaluate_exit(pos: &Position, candle: &Candle, current_bar: usize, p: &StrategyParams) -> Option<ExitAction> {
    let dir = pos.direction;

    let tp1_hit = match dir {
        Direction::Long => candle.high >= pos.take_profit_1,
        Direction::Short => candle.low <= pos.take_profit_1,
    };
    let sl_touched = match dir {
        Direction::Long => candle.low <= pos.stop_loss,
        Direction::Short => candle.high >= pos.stop_loss,
    };
    if !pos.partial_exit_done && tp1_hit {
        // TP1 and SL in the same candle is the intrabar ambiguity again:
        // the level closer to the open is assumed to have traded first.
        if sl_touched
            && (candle.open - pos.stop_loss).abs() <= (candle.open - pos.take_profit_1).abs()
        {
            return Some(ExitAction::Full { price: pos.stop_loss, reason: ExitReason::StopLoss });
        }
        if p.tp1_close_pct >= 1.0 {
            return Some(ExitAction::Full { price: pos.take_profit_1, reason: ExitReason::TakeProfit1 });
        }
        return Some(ExitAction::Partial { price: pos.take_profit_1 });
    }

    let tp2_hit = match dir {
        Direction::Long => candle.high >= pos.take_profit_2,
        Direction::Short => candle.low <= pos.take_profit_2,
    };

    match (tp2_hit, sl_touched) {
        (true, true) => {
            // Both touched intrabar: without tick data, award the exit to the
            // level closer to the open. Ties go to the stop.
            let to_tp = (candle.open - pos.take_profit_2).abs();
            let to_sl = (candle.open - pos.stop_loss).abs();
            if to_tp < to_sl {
                Some(ExitAction::Full { price: pos.take_profit_2, reason: ExitReason::TakeProfit2 })
            } else {
                Some(ExitAction::Full { price: pos.stop_loss, reason: ExitReason::StopLoss })
            }
        }
        (true, false) => Some(ExitAction::Full { price: pos.take_profit_2, reason: ExitReason::TakeProfit2 }),
        (false, true) => Some(ExitAction::Full { price: pos.stop_loss, reason: ExitReason::StopLoss }),
        (false, false) => {
            if current_bar.saturating_sub(pos.entry_bar) >= p.max_holding_bars {
                Some(ExitAction::Full { price: candle.open, reason: ExitReason::TimeStop })
            } else {
                None
            }
        }
    }
}

/// The one mutation a position suffers: TP1 partial taken, stop moved to
/// exactly the entry (no offset).
pub fn apply_partial(pos: &Position, p: &StrategyParams) -> Position {
    let mut out = pos.clone();
    out.remaining_size = 1.0 - p.tp1_close_pct;
    out.stop_loss = pos.entry;
    out.partial_exit_done = true;
    out
}

/// Finalize a Trade record for the exited portion of the position.
/// Fees: maker on the entry notional, taker on the exit notional.
pub fn build_trade(
    pos: &Position,
    exit_price: f64,
    portion: f64,
    exit_time: i64,
    reason: ExitReason,
    p: &StrategyParams,
) -> Trade {
    let qty = pos.qty * portion;
    let raw = (exit_price - pos.entry) * pos.direction.sign() * qty;
    let fees = pos.entry * qty * p.maker_fee + exit_price * qty * p.taker_fee;
    let pnl = raw - fees;
    let margin_portion = pos.margin * portion;
    let pnl_pct = if margin_portion > 0.0 { pnl / margin_portion * 100.0 } else { 0.0 };

    // Time stops are scored by raw price movement, not by net PnL.
    let is_win = match reason {
        ExitReason::TimeStop => (exit_price - pos.entry) * pos.direction.sign() > 0.0,
        _ => pnl > 0.0,
    };

    Trade {
        entry_time: pos.entry_time,
        exit_time,
        direction: pos.direction,
        entry: pos.entry,
        exit: exit_price,
        size: qty,
        fees,
        pnl,
        pnl_pct,
        is_win,
        method: pos.method,
        reason,
    }
}

/// Sanity checks before an order reaches the exchange: catches inverted SL/TP
/// or dust quantities before they cost money.
pub fn validate_entry(pos: &Position) -> Result<(), String> {
    if pos.qty <= 0.0 {
        return Err("position size is zero".to_string());
    }
    let notional = pos.qty * pos.entry;
    if notional < MIN_ORDER_NOTIONAL {
        return Err(format!(
            "notional {:.2} USDT below minimum {:.0} USDT (qty={:.4} @ {:.2})",
            notional, MIN_ORDER_NOTIONAL, pos.qty, pos.entry
        ));
    }
    match pos.direction {
        Direction::Long => {
            if pos.stop_loss >= pos.entry {
                return Err(format!(
                    "SL {:.6} must be below entry {:.6} for Buy",
                    pos.stop_loss, pos.entry
                ));
            }
            if pos.take_profit_1 <= pos.entry {
                return Err(format!(
                    "TP {:.6} must be above entry {:.6} for Buy",
                    pos.take_profit_1, pos.entry
                ));
            }
        }
        Direction::Short => {
            if pos.stop_loss <= pos.entry {
                return Err(format!(
                    "SL {:.6} must be above entry {:.6} for Sell",
                    pos.stop_loss, pos.entry
                ));
            }
            if pos.take_profit_1 >= pos.entry {
                return Err(format!(
                    "TP {:.6} must be below entry {:.6} for Sell",
                    pos.take_profit_1, pos.entry
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ob_detector::METHOD_ORB;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume: 100.0 }
    }

    fn long_block() -> OrderBlock {
        OrderBlock {
            direction: Direction::Long,
            top: 103.0,
            bottom: 100.0,
            method: METHOD_ORB,
            detected_bar: 10,
            age: 0,
            moved_away: true,
            volume_ratio: 3.0,
            filter_score: 0.0,
        }
    }

    fn params() -> StrategyParams {
        StrategyParams { slippage_pct: 0.0, enable_risk_cap: false, ..StrategyParams::default() }
    }

    #[test]
    fn fill_geometry_long() {
        let p = params();
        let ob = long_block();
        let pos = plan_fill(&ob, ob.midpoint(), 1.0, 100.0, 0, 20, &p);
        assert_eq!(pos.entry, 101.5);
        // SL = bottom × (1 − 0.005) = 99.5
        assert!((pos.stop_loss - 99.5).abs() < 1e-9);
        let risk = pos.entry - pos.stop_loss;
        assert!((pos.take_profit_1 - (pos.entry + risk)).abs() < 1e-9);
        assert!((pos.take_profit_2 - (pos.entry + 2.0 * risk)).abs() < 1e-9);
        // qty = margin × leverage / entry
        assert!((pos.qty - 100.0 * 3.0 / 101.5).abs() < 1e-9);
    }

    #[test]
    fn fill_slippage_is_adverse() {
        let p = StrategyParams { slippage_pct: 0.001, ..params() };
        let ob = long_block();
        let pos = plan_fill(&ob, 101.5, 1.0, 100.0, 0, 20, &p);
        assert!(pos.entry > 101.5);

        let mut short = ob.clone();
        short.direction = Direction::Short;
        let pos = plan_fill(&short, 101.5, 1.0, 100.0, 0, 20, &p);
        assert!(pos.entry < 101.5);
    }

    #[test]
    fn risk_cap_shrinks_never_widens() {
        let ob = long_block();
        // Wide natural stop (2.0 + buffer), tight cap: 0.5 × 1.0 ATR
        let p = StrategyParams { enable_risk_cap: true, max_risk_atr: 0.5, slippage_pct: 0.0, ..StrategyParams::default() };
        let pos = plan_fill(&ob, 101.5, 1.0, 100.0, 0, 20, &p);
        assert!((pos.entry - pos.stop_loss - 0.5).abs() < 1e-9);

        // Cap looser than the natural stop → untouched
        let p = StrategyParams { enable_risk_cap: true, max_risk_atr: 50.0, slippage_pct: 0.0, ..StrategyParams::default() };
        let pos = plan_fill(&ob, 101.5, 1.0, 100.0, 0, 20, &p);
        assert!((pos.stop_loss - 99.5).abs() < 1e-9);
    }

    fn open_long() -> Position {
        Position {
            direction: Direction::Long,
            entry: 100.0,
            stop_loss: 98.0,
            take_profit_1: 102.0,
            take_profit_2: 104.0,
            entry_time: 0,
            entry_bar: 0,
            margin: 100.0,
            qty: 3.0,
            remaining_size: 1.0,
            partial_exit_done: false,
            method: METHOD_ORB,
        }
    }

    #[test]
    fn tp1_wins_when_closer_to_open() {
        let pos = open_long();
        let p = params();
        // TP1 and SL both touched; open at 101 sits nearer TP1 (102) than SL (98)
        let action = evaluate_exit(&pos, &candle(101.0, 102.5, 97.5, 100.0), 1, &p).unwrap();
        assert_eq!(action, ExitAction::Partial { price: 102.0 });
    }

    #[test]
    fn sl_wins_over_tp1_when_closer_to_open() {
        let pos = open_long();
        let p = params();
        // Open at 98.5: the stop is assumed to trade first
        let action = evaluate_exit(&pos, &candle(98.5, 102.5, 97.5, 100.0), 1, &p).unwrap();
        assert_eq!(action, ExitAction::Full { price: 98.0, reason: ExitReason::StopLoss });
    }

    #[test]
    fn tp1_full_when_close_pct_is_total() {
        let pos = open_long();
        let p = StrategyParams { tp1_close_pct: 1.0, ..params() };
        let action = evaluate_exit(&pos, &candle(100.0, 102.5, 99.5, 100.0), 1, &p).unwrap();
        assert_eq!(action, ExitAction::Full { price: 102.0, reason: ExitReason::TakeProfit1 });
    }

    #[test]
    fn breakeven_after_partial() {
        let pos = open_long();
        let p = params(); // tp1_close_pct 0.8
        let after = apply_partial(&pos, &p);
        assert_eq!(after.stop_loss, 100.0); // exactly the entry, no offset
        assert!((after.remaining_size - 0.2).abs() < 1e-12);
        assert!(after.partial_exit_done);
    }

    #[test]
    fn both_touched_resolved_by_proximity_to_open() {
        let mut pos = open_long();
        pos.partial_exit_done = true;
        let p = params();
        // Open at 98.5: |open−SL| = 0.5 < |open−TP2| = 5.5 → SL wins
        let action = evaluate_exit(&pos, &candle(98.5, 104.5, 97.5, 100.0), 5, &p).unwrap();
        assert_eq!(action, ExitAction::Full { price: 98.0, reason: ExitReason::StopLoss });

        // Open at 103.8: TP2 closer → TP2 wins
        let action = evaluate_exit(&pos, &candle(103.8, 104.5, 97.5, 100.0), 5, &p).unwrap();
        assert_eq!(action, ExitAction::Full { price: 104.0, reason: ExitReason::TakeProfit2 });
    }

    #[test]
    fn time_stop_exits_at_open() {
        let mut pos = open_long();
        pos.partial_exit_done = true;
        let p = params(); // max_holding_bars 48
        let quiet = candle(100.5, 101.0, 99.0, 100.5);
        assert!(evaluate_exit(&pos, &quiet, 47, &p).is_none());
        let action = evaluate_exit(&pos, &quiet, 48, &p).unwrap();
        assert_eq!(action, ExitAction::Full { price: 100.5, reason: ExitReason::TimeStop });
    }

    #[test]
    fn time_stop_scored_by_price_movement() {
        let pos = open_long();
        let p = params();
        // Tiny favourable move that fees would wipe out: still a win
        let t = build_trade(&pos, 100.001, 1.0, 10, ExitReason::TimeStop, &p);
        assert!(t.is_win);
        assert!(t.pnl < 0.0); // fees exceed the move

        let t = build_trade(&pos, 99.9, 1.0, 10, ExitReason::TimeStop, &p);
        assert!(!t.is_win);
    }

    #[test]
    fn trade_fees_and_pnl() {
        let pos = open_long(); // qty 3.0
        let p = params();
        let t = build_trade(&pos, 104.0, 0.2, 10, ExitReason::TakeProfit2, &p);
        let qty = 3.0 * 0.2;
        let raw = 4.0 * qty;
        let fees = 100.0 * qty * p.maker_fee + 104.0 * qty * p.taker_fee;
        assert!((t.fees - fees).abs() < 1e-12);
        assert!((t.pnl - (raw - fees)).abs() < 1e-12);
        assert!(t.is_win);
        assert!((t.size - qty).abs() < 1e-12);
    }

    #[test]
    fn validate_entry_catches_inverted_levels() {
        let mut pos = open_long();
        pos.qty = 10.0;
        assert!(validate_entry(&pos).is_ok());
        pos.stop_loss = 101.0;
        assert!(validate_entry(&pos).is_err());
    }
}
