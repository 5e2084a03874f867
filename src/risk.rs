use crate::config::StrategyParams;

/// Win/loss streak state carried across positions. One instance per account
/// when capital is pooled across symbols (single writer), or one per backtest
/// run.
#[derive(Clone, Debug)]
pub struct RiskState {
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub size_multiplier: f64,
}

impl Default for RiskState {
    fn default() -> Self {
        RiskState {
            consecutive_losses: 0,
            consecutive_wins: 0,
            size_multiplier: 1.0,
        }
    }
}

impl RiskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update streak counters and the size multiplier after a full exit.
    /// The clamp only ratchets tighter within a losing streak; three
    /// consecutive wins restore full size.
    pub fn record_result(&mut self, is_win: bool) {
        if is_win {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
            if self.consecutive_wins >= 3 {
                self.size_multiplier = 1.0;
            }
        } else {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
            if self.consecutive_losses >= 10 {
                self.size_multiplier = self.size_multiplier.min(0.25);
            } else if self.consecutive_losses >= 5 {
                self.size_multiplier = self.size_multiplier.min(0.5);
            }
        }
    }

    /// Margin for a new position: the capital fraction clamped to the
    /// configured band, scaled by the streak multiplier, floored again at
    /// min_margin.
    pub fn margin(&self, capital: f64, p: &StrategyParams) -> f64 {
        let base = (p.capital_fraction * capital).clamp(p.min_margin, p.max_margin);
        (base * self.size_multiplier).max(p.min_margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_ladder_boundaries() {
        let mut r = RiskState::new();
        for i in 1..=4 {
            r.record_result(false);
            assert_eq!(r.size_multiplier, 1.0, "after {i} losses");
        }
        r.record_result(false); // 5th
        assert_eq!(r.size_multiplier, 0.5);
        for _ in 6..=9 {
            r.record_result(false);
            assert_eq!(r.size_multiplier, 0.5);
        }
        r.record_result(false); // 10th
        assert_eq!(r.size_multiplier, 0.25);
        for _ in 0..20 {
            r.record_result(false);
            assert_eq!(r.size_multiplier, 0.25); // never below 0.25
        }
    }

    #[test]
    fn reset_needs_three_consecutive_wins() {
        let mut r = RiskState::new();
        for _ in 0..6 { r.record_result(false); }
        assert_eq!(r.size_multiplier, 0.5);

        r.record_result(true);
        r.record_result(true);
        assert_eq!(r.size_multiplier, 0.5); // two wins are not enough
        r.record_result(false); // streak broken
        assert_eq!(r.consecutive_wins, 0);
        assert_eq!(r.size_multiplier, 0.5);

        r.record_result(true);
        r.record_result(true);
        r.record_result(true);
        assert_eq!(r.size_multiplier, 1.0);
    }

    #[test]
    fn losing_ratchet_never_loosens() {
        let mut r = RiskState::new();
        for _ in 0..10 { r.record_result(false); }
        assert_eq!(r.size_multiplier, 0.25);
        // A fresh streak of 5 must not lift the clamp back to 0.5
        r.record_result(true);
        for _ in 0..5 { r.record_result(false); }
        assert_eq!(r.size_multiplier, 0.25);
    }

    #[test]
    fn margin_respects_band_and_floor() {
        let p = StrategyParams::default(); // fraction 0.10, min 10, max 500
        let r = RiskState::new();
        assert_eq!(r.margin(10_000.0, &p), 500.0); // 1000 clamped to max
        assert_eq!(r.margin(2_000.0, &p), 200.0);
        assert_eq!(r.margin(50.0, &p), 10.0); // 5 floored to min

        let mut halved = RiskState::new();
        for _ in 0..5 { halved.record_result(false); }
        assert_eq!(halved.margin(2_000.0, &p), 100.0);
        // Multiplier result still floored at min_margin
        assert_eq!(halved.margin(50.0, &p), 10.0);
    }
}
