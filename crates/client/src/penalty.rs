//! Exponential back-off penalty box: a level that just failed is banned
//! for an increasing interval, reset by a manual switch onto it.

use std::collections::HashMap;

const BASE_MS: f64 = 30_000.0;
const MAX_MS: f64 = 120_000.0;

/// Tracks failure counts and ban expiry per level id. `now_ms` is supplied
/// by the caller on every query so this stays independent of any browser
/// clock API (and is trivially unit-testable).
#[derive(Debug, Clone, Default)]
pub struct PenaltyBox {
    failures: HashMap<String, u32>,
    banned_until_ms: HashMap<String, f64>,
}

impl PenaltyBox {
    /// Record a failed attempt at `level_id`, banning it until
    /// `now_ms + min(BASE * 2^(failures-1), MAX)`.
    pub fn record_failure(&mut self, level_id: &str, now_ms: f64) {
        let count = self.failures.entry(level_id.to_string()).or_insert(0);
        *count += 1;
        let backoff = (BASE_MS * 2f64.powi(*count as i32 - 1)).min(MAX_MS);
        self.banned_until_ms.insert(level_id.to_string(), now_ms + backoff);
    }

    pub fn is_banned(&self, level_id: &str, now_ms: f64) -> bool {
        self.banned_until_ms.get(level_id).is_some_and(|&until| now_ms < until)
    }

    /// A manual switch onto `level_id` clears its failure count and ban.
    pub fn clear(&mut self, level_id: &str) {
        self.failures.remove(level_id);
        self.banned_until_ms.remove(level_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_failure_bans_for_base_interval() {
        let mut box_ = PenaltyBox::default();
        box_.record_failure("low", 0.0);
        assert!(box_.is_banned("low", 29_999.0));
        assert!(!box_.is_banned("low", 30_000.0));
    }

    #[test]
    fn repeated_failures_double_the_backoff_up_to_max() {
        let mut box_ = PenaltyBox::default();
        box_.record_failure("low", 0.0); // banned until 30_000
        box_.record_failure("low", 30_000.0); // 60_000 backoff -> until 90_000
        assert!(box_.is_banned("low", 89_999.0));
        box_.record_failure("low", 90_000.0); // 120_000 backoff (capped) -> until 210_000
        box_.record_failure("low", 210_000.0); // still capped at MAX
        assert!(box_.is_banned("low", 329_999.0));
        assert!(!box_.is_banned("low", 330_000.0));
    }

    #[test]
    fn manual_switch_clears_ban() {
        let mut box_ = PenaltyBox::default();
        box_.record_failure("low", 0.0);
        box_.clear("low");
        assert!(!box_.is_banned("low", 0.0));
    }
}
