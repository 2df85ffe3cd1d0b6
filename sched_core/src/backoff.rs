//! Retry backoff policies (§4.5). Generalized from the shape of
//! `gl_db::DatabaseRetryConfig::calculate_delay`, which computed a capped
//! exponential delay for reconnecting to a database; here it backs the
//! Executor's inter-attempt delay instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(crate::Error::InvalidConfiguration(format!(
                "unknown backoff kind: {}",
                other
            ))),
        }
    }
}

/// Fully-resolved backoff configuration (base/factor/max all have sensible
/// defaults per §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_ms: 1000,
            factor: 2.0,
            max_ms: 30_000,
        }
    }
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_ms: delay_ms,
            ..Default::default()
        }
    }

    pub fn exponential(base_ms: u64, factor: f64, max_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_ms,
            factor,
            max_ms,
        }
    }

    /// Delay to apply before the given (1-indexed) attempt's retry.
    /// `attempt` is the attempt number that just failed — the first retry's
    /// delay is computed with `attempt = 1`, per §4.5.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = match self.kind {
            BackoffKind::Fixed => self.base_ms,
            BackoffKind::Exponential => {
                let scaled = self.base_ms as f64 * self.factor.powi(attempt as i32 - 1);
                scaled.min(self.max_ms as f64) as u64
            }
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let b = Backoff::fixed(1000);
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(b.delay_for_attempt(5), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_grows_and_clamps() {
        let b = Backoff::exponential(1000, 2.0, 30_000);
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(4000));
        // clamps well before attempt 10
        assert_eq!(b.delay_for_attempt(10), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_kind_parses_from_str() {
        use std::str::FromStr;
        assert_eq!(BackoffKind::from_str("fixed").unwrap(), BackoffKind::Fixed);
        assert_eq!(
            BackoffKind::from_str("exponential").unwrap(),
            BackoffKind::Exponential
        );
        assert!(BackoffKind::from_str("linear").is_err());
    }
}
