//! Rate-limit classifier: maps a provider rejection and the item's
//! consecutive-failure count to a retry decision.
//!
//! Pure and deterministic: no clock, no I/O. The counter lives on the item in
//! the store, so tiers survive restarts and are shared by every worker.

use std::time::Duration;

use nexus_core::ErrorSignal;
use nexus_core::config::{RateLimitConfig, TierRule};

/// SMTP replies that mean "not now" rather than "never".
const TRY_LATER_CODES: [u16; 4] = [421, 450, 451, 452];

/// Phrases providers use for throttling, sometimes behind a 5xx code.
const CAPACITY_PHRASES: [&str; 8] = [
    "rate limit",
    "ratelimit",
    "quota",
    "try again later",
    "try later",
    "too many",
    "throttl",
    "temporarily",
];

/// What to do with a rejected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up: the item becomes `failed`.
    Permanent,
    /// Hold the item for this long, then make it eligible again.
    RetryAfter(Duration),
}

/// Ordered failure-count → delay table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureTiers {
    rules: Vec<TierRule>,
}

impl FailureTiers {
    /// Build from already validated rules (see `RateLimitConfig::validate`).
    pub fn new(mut rules: Vec<TierRule>) -> Self {
        rules.sort_by_key(|r| r.min_failures);
        Self { rules }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.tiers.clone())
    }

    /// Delay of the highest tier whose threshold `failures` reaches.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let secs = self
            .rules
            .iter()
            .rev()
            .find(|r| failures >= r.min_failures)
            .or(self.rules.first())
            .map(|r| r.delay_secs)
            .unwrap_or(0);
        Duration::from_secs(secs)
    }
}

impl Default for FailureTiers {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

/// Whether a rejection is the provider refusing capacity rather than the message.
pub fn is_capacity_rejection(signal: &ErrorSignal) -> bool {
    if signal.transient {
        return true;
    }
    if signal.code.is_some_and(|c| TRY_LATER_CODES.contains(&c)) {
        return true;
    }
    let message = signal.message.to_lowercase();
    CAPACITY_PHRASES.iter().any(|p| message.contains(p))
}

/// Classify a rejection. `consecutive_failures` is the item's counter after
/// this rejection was counted; the tier is looked up for the next attempt.
pub fn classify(
    signal: &ErrorSignal,
    consecutive_failures: u32,
    tiers: &FailureTiers,
) -> RetryDecision {
    if !is_capacity_rejection(signal) {
        return RetryDecision::Permanent;
    }
    RetryDecision::RetryAfter(tiers.delay_for(consecutive_failures.saturating_add(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> RetryDecision {
        RetryDecision::RetryAfter(Duration::from_secs(s))
    }

    #[test]
    fn test_default_tier_table() {
        let tiers = FailureTiers::default();
        assert_eq!(tiers.delay_for(1), Duration::from_secs(30));
        assert_eq!(tiers.delay_for(2), Duration::from_secs(30));
        assert_eq!(tiers.delay_for(3), Duration::from_secs(60));
        assert_eq!(tiers.delay_for(5), Duration::from_secs(60));
        assert_eq!(tiers.delay_for(6), Duration::from_secs(3600));
        assert_eq!(tiers.delay_for(500), Duration::from_secs(3600));
        // below the first threshold falls back to the first tier
        assert_eq!(tiers.delay_for(0), Duration::from_secs(30));
    }

    #[test]
    fn test_first_and_second_rejection() {
        let tiers = FailureTiers::default();
        let signal = ErrorSignal::transient(421, "Try again later");
        assert_eq!(classify(&signal, 1, &tiers), secs(30));
        assert_eq!(classify(&signal, 2, &tiers), secs(60));
        assert_eq!(classify(&signal, 5, &tiers), secs(3600));
    }

    #[test]
    fn test_delay_is_monotonic() {
        let tiers = FailureTiers::default();
        let signal = ErrorSignal::transient(450, "mailbox busy");
        let mut last = Duration::ZERO;
        for failures in 0..50 {
            match classify(&signal, failures, &tiers) {
                RetryDecision::RetryAfter(d) => {
                    assert!(d >= last, "delay shrank at {failures}");
                    last = d;
                }
                RetryDecision::Permanent => panic!("transient classified permanent"),
            }
        }
    }

    #[test]
    fn test_permanent_ignores_counter() {
        let tiers = FailureTiers::default();
        let signal = ErrorSignal::permanent(550, "5.1.1 No such user");
        for failures in [0, 1, 2, 6, 1000] {
            assert_eq!(classify(&signal, failures, &tiers), RetryDecision::Permanent);
        }
    }

    #[test]
    fn test_quota_message_behind_5xx_is_transient() {
        let signal = ErrorSignal::permanent(550, "5.4.5 Daily user sending quota exceeded");
        assert!(is_capacity_rejection(&signal));
        let signal = ErrorSignal::permanent(554, "Too many messages, slow down");
        assert!(is_capacity_rejection(&signal));
    }

    #[test]
    fn test_try_later_codes_without_flag() {
        let signal = ErrorSignal {
            code: Some(421),
            message: "Service not available".into(),
            transient: false,
        };
        assert!(is_capacity_rejection(&signal));
    }

    #[test]
    fn test_custom_tiers_sorted() {
        let tiers = FailureTiers::new(vec![
            TierRule { min_failures: 4, delay_secs: 120 },
            TierRule { min_failures: 1, delay_secs: 10 },
        ]);
        assert_eq!(tiers.delay_for(3), Duration::from_secs(10));
        assert_eq!(tiers.delay_for(4), Duration::from_secs(120));
    }
}
