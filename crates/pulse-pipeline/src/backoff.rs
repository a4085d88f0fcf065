use std::time::Duration;

use rand::Rng;
use tracing::info;

/// Development-mode reporting cadence.
pub const DEFAULT_LIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound of the random jitter added to a retry delay, in seconds.
pub const DEFAULT_JITTER_MAX_SECS: f64 = 60.0;
/// Ceiling on the additive backoff penalty, in seconds.
pub const DEFAULT_PENALTY_CAP_SECS: f64 = 300.0;

/// Tunables for flush scheduling.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub live_interval: Duration,
    pub jitter_max_secs: f64,
    pub penalty_cap_secs: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            live_interval: DEFAULT_LIVE_INTERVAL,
            jitter_max_secs: DEFAULT_JITTER_MAX_SECS,
            penalty_cap_secs: DEFAULT_PENALTY_CAP_SECS,
        }
    }
}

/// Computes the delay before the next flush attempt.
///
/// With no recent failures the delay is just the reporting cadence: a short
/// fixed interval in live mode, the server-configured interval otherwise.
/// Each consecutive failure adds `min(2^failures + jitter, cap)` seconds, so
/// retries spread out across client instances instead of arriving together.
#[derive(Debug)]
pub struct BackoffController {
    config: BackoffConfig,
    failures: u32,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn delay(&self, live_mode: bool, reporting_interval: Duration) -> Duration {
        let base = if live_mode {
            self.config.live_interval
        } else {
            reporting_interval
        };

        if self.failures == 0 {
            return base;
        }

        // Clamp the exponent; past ~30 the penalty cap dominates anyway and
        // powf on huge exponents is just asking for infinities.
        let exp = 2f64.powf(self.failures.min(30) as f64);
        let jitter = if self.config.jitter_max_secs > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.jitter_max_secs)
        } else {
            0.0
        };
        let penalty = (exp + jitter).min(self.config.penalty_cap_secs);

        base + Duration::from_secs_f64(penalty)
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// App-active lifecycle signal: connectivity may have recovered, so the
    /// next attempt goes out at the base cadence even though no flush has
    /// succeeded yet.
    pub fn reset(&mut self) {
        if self.failures > 0 {
            info!(failures = self.failures, "app became active, resetting delivery backoff");
        }
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORTING: Duration = Duration::from_secs(60);

    fn no_jitter() -> BackoffController {
        BackoffController::new(BackoffConfig {
            jitter_max_secs: 0.0,
            ..BackoffConfig::default()
        })
    }

    #[test]
    fn healthy_production_uses_reporting_interval() {
        let backoff = BackoffController::default();
        assert_eq!(backoff.delay(false, REPORTING), REPORTING);
        assert_eq!(
            backoff.delay(false, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn healthy_live_mode_uses_short_interval() {
        let backoff = BackoffController::default();
        assert_eq!(backoff.delay(true, REPORTING), Duration::from_secs(5));
    }

    #[test]
    fn penalty_grows_exponentially_without_jitter() {
        let mut backoff = no_jitter();

        backoff.record_failure();
        assert_eq!(backoff.delay(false, REPORTING), REPORTING + Duration::from_secs(2));

        backoff.record_failure();
        assert_eq!(backoff.delay(false, REPORTING), REPORTING + Duration::from_secs(4));

        backoff.record_failure();
        assert_eq!(backoff.delay(false, REPORTING), REPORTING + Duration::from_secs(8));
    }

    #[test]
    fn penalty_capped_at_ceiling() {
        let mut backoff = no_jitter();
        for _ in 0..20 {
            backoff.record_failure();
        }
        assert_eq!(
            backoff.delay(false, REPORTING),
            REPORTING + Duration::from_secs(300)
        );
    }

    #[test]
    fn delay_bounded_even_with_jitter() {
        let mut backoff = BackoffController::default();
        for _ in 0..10 {
            backoff.record_failure();
        }
        for _ in 0..50 {
            let delay = backoff.delay(false, REPORTING);
            assert!(delay >= REPORTING);
            assert!(delay <= REPORTING + Duration::from_secs(300));
        }
    }

    #[test]
    fn monotone_in_failures_without_jitter() {
        let mut backoff = no_jitter();
        let mut previous = backoff.delay(false, REPORTING);
        for _ in 0..12 {
            backoff.record_failure();
            let next = backoff.delay(false, REPORTING);
            assert!(next >= previous, "{next:?} < {previous:?}");
            previous = next;
        }
    }

    #[test]
    fn success_and_reset_clear_failures() {
        let mut backoff = no_jitter();
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.failures(), 2);

        backoff.record_success();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.delay(false, REPORTING), REPORTING);

        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn extreme_failure_counts_do_not_overflow() {
        let mut backoff = no_jitter();
        for _ in 0..1000 {
            backoff.record_failure();
        }
        assert_eq!(
            backoff.delay(false, REPORTING),
            REPORTING + Duration::from_secs(300)
        );
    }
}
