use std::time::Duration;

/// Reconnect backoff policy.
///
/// The delay for attempt `n >= 1` is
/// `min(max_delay, initial_delay * multiplier^(n - 1))`, perturbed by up to
/// `±jitter_ratio` and clamped to `0..=max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    enabled: bool,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter_ratio: f64,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            enabled: true,
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: None,
        }
    }

    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_ratio: 0.0,
            max_attempts: Some(0),
        }
    }

    /// Growth factor, floored at 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Jitter fraction, clamped to `0..=1`.
    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// `None` means unbounded.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether `attempts` already used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Capped delay before jitter, in milliseconds.
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        if self.initial_delay_ms == 0 {
            return 0.0;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let grown = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        grown.min(self.max_delay_ms as f64)
    }

    /// Delay for `attempt`, with `sample` drawn uniformly from `[0, 1)`.
    pub fn delay_for_attempt(&self, attempt: u32, sample: f64) -> Duration {
        let capped = self.base_delay_ms(attempt);
        let perturbed = if self.jitter_ratio <= 0.0 {
            capped
        } else {
            let jitter = (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * self.jitter_ratio;
            (capped * (1.0 + jitter)).round()
        };
        let bounded = perturbed.clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(bounded as u64)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(600, 20_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_initial_delay() {
        let policy = ReconnectPolicy::new(250, 8_000).with_jitter_ratio(0.0);
        assert_eq!(policy.delay_for_attempt(1, 0.5), Duration::from_millis(250));
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let policy = ReconnectPolicy::new(100, 10_000).with_jitter_ratio(0.0);
        assert_eq!(policy.delay_for_attempt(4, 0.0), Duration::from_millis(800));

        let triple = policy.with_multiplier(3.0);
        assert_eq!(triple.delay_for_attempt(3, 0.0), Duration::from_millis(900));
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = ReconnectPolicy::new(1_000, 4_000).with_jitter_ratio(0.0);
        assert_eq!(policy.delay_for_attempt(6, 0.0), Duration::from_millis(4_000));
        assert_eq!(
            policy.delay_for_attempt(u32::MAX, 0.0),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = ReconnectPolicy::new(600, 20_000).with_jitter_ratio(1.0);
        for attempt in 1..=40 {
            for sample in [0.0, 0.1, 0.5, 0.9, 0.999_999] {
                let delay = policy.delay_for_attempt(attempt, sample);
                assert!(delay <= Duration::from_millis(20_000));
            }
        }
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::ZERO);
    }

    #[test]
    fn jitter_perturbs_by_ratio() {
        let policy = ReconnectPolicy::new(1_000, 20_000).with_jitter_ratio(0.2);
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(1, 0.5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1, 1.0), Duration::from_millis(1_200));
    }

    #[test]
    fn normalizes_out_of_range_settings() {
        let policy = ReconnectPolicy::default()
            .with_multiplier(0.5)
            .with_jitter_ratio(4.0);
        assert_eq!(policy.multiplier(), 1.0);
        assert_eq!(policy.jitter_ratio(), 1.0);

        let policy = ReconnectPolicy::default().with_multiplier(f64::NAN);
        assert_eq!(policy.multiplier(), 1.0);
    }

    #[test]
    fn exhaustion_respects_unbounded_default() {
        assert!(!ReconnectPolicy::default().is_exhausted(u32::MAX));
        let bounded = ReconnectPolicy::default().with_max_attempts(Some(2));
        assert!(!bounded.is_exhausted(1));
        assert!(bounded.is_exhausted(2));
        assert!(ReconnectPolicy::disabled().is_exhausted(0));
    }
}
