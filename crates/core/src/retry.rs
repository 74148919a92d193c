//! Retry and dead-letter decisions.
//!
//! [`decide`] is a pure function of the job's retry bookkeeping and the
//! failure that just happened. It never touches the database; the result
//! writer and the claim reaper both feed it and persist whatever it returns.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Category of a failed execution attempt. Stored in `jobs.failure_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Subprocess exited non-zero.
    Execution,
    /// Subprocess exited cleanly but its output could not be decoded.
    OutputParse,
    /// Subprocess exceeded the wall-clock limit and was killed.
    Timeout,
    /// The job payload failed validation.
    InvalidPayload,
    /// The claim expired without acknowledgment (worker presumed dead).
    ClaimExpired,
    /// The subprocess could not be started at all.
    Spawn,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::OutputParse => "output_parse",
            Self::Timeout => "timeout",
            Self::InvalidPayload => "invalid_payload",
            Self::ClaimExpired => "claim_expired",
            Self::Spawn => "spawn",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "execution" => Ok(Self::Execution),
            "output_parse" => Ok(Self::OutputParse),
            "timeout" => Ok(Self::Timeout),
            "invalid_payload" => Ok(Self::InvalidPayload),
            "claim_expired" => Ok(Self::ClaimExpired),
            "spawn" => Ok(Self::Spawn),
            other => Err(CoreError::Validation(format!(
                "Unknown failure kind: \"{other}\""
            ))),
        }
    }
}

/// One failed attempt: what went wrong and the message to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Text persisted into `jobs.error_message`, prefixed with the kind so
    /// operators can tell a timeout from a crash at a glance.
    pub fn error_message(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Decides whether a failure is worth retrying at all.
pub trait FailureClassifier: Send + Sync {
    fn is_retryable(&self, failure: &Failure) -> bool;
}

/// Classifier driven by configuration: a set of failure kinds and a list of
/// message patterns that are never retried.
#[derive(Debug, Clone)]
pub struct ConfiguredClassifier {
    non_retryable_kinds: HashSet<FailureKind>,
    non_retryable_patterns: Vec<Regex>,
}

impl ConfiguredClassifier {
    pub fn new(kinds: impl IntoIterator<Item = FailureKind>, patterns: Vec<Regex>) -> Self {
        Self {
            non_retryable_kinds: kinds.into_iter().collect(),
            non_retryable_patterns: patterns,
        }
    }

    /// Parse a comma-separated kind list and a `;`-separated pattern list.
    ///
    /// Empty entries are ignored; an unknown kind or an invalid regex is an error.
    pub fn parse(kinds: &str, patterns: &str) -> Result<Self, CoreError> {
        let kinds = kinds
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(FailureKind::from_str)
            .collect::<Result<HashSet<_>, _>>()?;

        let patterns = patterns
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                Regex::new(p).map_err(|e| CoreError::Config {
                    key: "NON_RETRYABLE_PATTERNS",
                    message: format!("invalid pattern \"{p}\": {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            non_retryable_kinds: kinds,
            non_retryable_patterns: patterns,
        })
    }
}

impl Default for ConfiguredClassifier {
    /// Invalid payloads are the only failures that can never succeed on retry.
    fn default() -> Self {
        Self::new([FailureKind::InvalidPayload], Vec::new())
    }
}

impl FailureClassifier for ConfiguredClassifier {
    fn is_retryable(&self, failure: &Failure) -> bool {
        if self.non_retryable_kinds.contains(&failure.kind) {
            return false;
        }
        !self
            .non_retryable_patterns
            .iter()
            .any(|re| re.is_match(&failure.message))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`,
/// with an optional symmetric jitter fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `0.0..=1.0`; `0.0` makes delays deterministic.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay at all, used when retries should be immediate.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Deterministic delay before the `attempt`-th retry (1-based).
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) with jitter applied, never exceeding `max_delay`.
    pub fn jittered_backoff(&self, attempt: i32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Put the job back in `queued`, invisible for `delay`.
    Requeue { retry_count: i32, delay: Duration },
    /// Move the job to `dead_lettered` with a terminal reason.
    DeadLetter { reason: String },
}

/// Decide the next state for a job that failed on attempt `retry_count + 1`.
///
/// Non-retryable failures are dead-lettered without touching `retry_count`.
/// Otherwise the job is requeued while `retry_count < max_retries`, so a job
/// that fails `max_retries + 1` times in a row ends up dead-lettered.
pub fn decide(
    retry_count: i32,
    max_retries: i32,
    failure: &Failure,
    classifier: &dyn FailureClassifier,
    policy: &RetryPolicy,
) -> RetryDecision {
    if !classifier.is_retryable(failure) {
        return RetryDecision::DeadLetter {
            reason: format!("non-retryable {}", failure.error_message()),
        };
    }

    if retry_count < max_retries {
        let next = retry_count + 1;
        RetryDecision::Requeue {
            retry_count: next,
            delay: policy.jittered_backoff(next),
        }
    } else {
        RetryDecision::DeadLetter {
            reason: format!(
                "retries exhausted after {} attempts; last {}",
                retry_count + 1,
                failure.error_message()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            jitter: 0.0,
        }
    }

    fn timeout() -> Failure {
        Failure::new(FailureKind::Timeout, "killed after 3600000ms")
    }

    // -- backoff --------------------------------------------------------------

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = no_jitter();
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_is_capped() {
        let p = no_jitter();
        assert_eq!(p.backoff(10), Duration::from_secs(600));
        assert_eq!(p.backoff(i32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = p.jittered_backoff(2);
            assert!(d >= Duration::from_secs(10) && d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn immediate_policy_has_zero_delay() {
        assert_eq!(RetryPolicy::immediate().jittered_backoff(4), Duration::ZERO);
    }

    // -- decide ---------------------------------------------------------------

    #[test]
    fn requeues_while_budget_remains() {
        let d = decide(0, 5, &timeout(), &ConfiguredClassifier::default(), &no_jitter());
        assert_eq!(
            d,
            RetryDecision::Requeue {
                retry_count: 1,
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn dead_letters_when_budget_exhausted() {
        let d = decide(5, 5, &timeout(), &ConfiguredClassifier::default(), &no_jitter());
        assert_matches!(d, RetryDecision::DeadLetter { reason } if reason.contains("6 attempts") && reason.contains("timeout"));
    }

    #[test]
    fn max_retries_plus_one_failures_reach_dead_letter() {
        let classifier = ConfiguredClassifier::default();
        let policy = no_jitter();
        let mut retry_count = 0;
        let mut failures = 0;
        loop {
            failures += 1;
            match decide(retry_count, 3, &timeout(), &classifier, &policy) {
                RetryDecision::Requeue { retry_count: next, .. } => retry_count = next,
                RetryDecision::DeadLetter { .. } => break,
            }
        }
        assert_eq!(failures, 4);
        assert_eq!(retry_count, 3);
    }

    #[test]
    fn invalid_payload_skips_retries() {
        let failure = Failure::new(FailureKind::InvalidPayload, "molecule: length");
        let d = decide(0, 5, &failure, &ConfiguredClassifier::default(), &no_jitter());
        assert_matches!(d, RetryDecision::DeadLetter { reason } if reason.starts_with("non-retryable"));
    }

    #[test]
    fn zero_max_retries_dead_letters_first_failure() {
        let d = decide(0, 0, &timeout(), &ConfiguredClassifier::default(), &no_jitter());
        assert_matches!(d, RetryDecision::DeadLetter { .. });
    }

    // -- classifier -----------------------------------------------------------

    #[test]
    fn classifier_parses_kinds_and_patterns() {
        let c = ConfiguredClassifier::parse("invalid_payload, output_parse", "basis set .* not found")
            .unwrap();
        assert!(!c.is_retryable(&Failure::new(FailureKind::OutputParse, "x")));
        assert!(!c.is_retryable(&Failure::new(
            FailureKind::Execution,
            "basis set def2-QZVPPD not found"
        )));
        assert!(c.is_retryable(&Failure::new(FailureKind::Execution, "segfault")));
    }

    #[test]
    fn classifier_with_empty_config_retries_everything() {
        let c = ConfiguredClassifier::parse("", "").unwrap();
        assert!(c.is_retryable(&Failure::new(FailureKind::InvalidPayload, "bad")));
    }

    #[test]
    fn classifier_rejects_unknown_kind() {
        assert!(ConfiguredClassifier::parse("bogus", "").is_err());
    }

    #[test]
    fn classifier_rejects_bad_regex() {
        let err = ConfiguredClassifier::parse("", "(unclosed").unwrap_err();
        assert_matches!(err, CoreError::Config { key: "NON_RETRYABLE_PATTERNS", .. });
    }

    #[test]
    fn failure_kind_round_trips_through_str() {
        for kind in [
            FailureKind::Execution,
            FailureKind::OutputParse,
            FailureKind::Timeout,
            FailureKind::InvalidPayload,
            FailureKind::ClaimExpired,
            FailureKind::Spawn,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
    }

    #[test]
    fn error_message_is_prefixed_with_kind() {
        assert_eq!(timeout().error_message(), "timeout: killed after 3600000ms");
    }
}
