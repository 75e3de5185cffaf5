//! # Retry Policy
//!
//! Classifies failures and computes backoff delays:
//! - Table-driven mapping from error category to failure class
//! - Exponential backoff with a ceiling; pre-jitter delays are
//!   non-decreasing across attempts
//! - Bounded symmetric jitter
//! - Per-target attempt caps, with a lower cap for unclassified errors
//!
//! Integrity failures are never retried; they route to quarantine.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Coarse error category used as the classification key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Generic recoverable I/O (sharing violations, transient blips)
    Io,
    /// Access denied or permission failure
    AccessDenied,
    /// Path or file not found
    PathNotFound,
    /// Device out of space
    StorageFull,
    /// Operation timed out
    Timeout,
    /// Digest mismatch or invariant violation
    InvariantViolation,
    /// Anything that resisted classification
    Uncategorized,
}

/// What the engine does about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff
    Transient,
    /// Per-target permanent failure
    Permanent,
    /// Quarantine; never retried automatically
    Integrity,
    /// Treated as transient with a low attempt cap
    Unknown,
}

/// Classification table, kept as data so additions stay declarative
const CLASSIFICATION: &[(ErrorCategory, FailureClass)] = &[
    (ErrorCategory::Io, FailureClass::Transient),
    (ErrorCategory::AccessDenied, FailureClass::Permanent),
    (ErrorCategory::PathNotFound, FailureClass::Permanent),
    (ErrorCategory::StorageFull, FailureClass::Transient),
    (ErrorCategory::Timeout, FailureClass::Transient),
    (ErrorCategory::InvariantViolation, FailureClass::Integrity),
    (ErrorCategory::Uncategorized, FailureClass::Unknown),
];

/// Attempt cap applied to `Unknown` failures regardless of configuration
const UNKNOWN_ATTEMPT_CAP: u32 = 2;

/// Map an I/O error to its category
pub fn categorize_io(error: &std::io::Error) -> ErrorCategory {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::PermissionDenied => ErrorCategory::AccessDenied,
        ErrorKind::NotFound => ErrorCategory::PathNotFound,
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WriteZero | ErrorKind::UnexpectedEof => ErrorCategory::Io,
        _ => {
            // ENOSPC surfaces as Other on stable; check the raw errno
            if error.raw_os_error() == Some(28) {
                ErrorCategory::StorageFull
            } else {
                ErrorCategory::Io
            }
        }
    }
}

/// Look up the failure class for a category
pub fn classify(category: ErrorCategory) -> FailureClass {
    CLASSIFICATION
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, class)| *class)
        .unwrap_or(FailureClass::Unknown)
}

/// Backoff calculator and attempt-cap enforcement
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Pre-jitter delay for a 1-based attempt number
    ///
    /// `base * multiplier^(attempt-1)`, capped at the configured ceiling.
    /// The sequence is non-decreasing because the multiplier is >= 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exponent = (attempt - 1).min(63);
        let factor = self.config.multiplier.max(1.0).powi(exponent as i32);
        let millis = (self.config.base_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay with bounded symmetric jitter applied
    ///
    /// Storage-full failures get an extended base so a full disk is probed
    /// far less aggressively than a transient blip.
    pub fn delay_with_jitter(&self, attempt: u32, category: ErrorCategory) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let base = if category == ErrorCategory::StorageFull {
            std::cmp::min(base * 4, Duration::from_millis(self.config.max_delay_ms))
        } else {
            base
        };

        let jitter_span = base.as_millis() as f64 * self.config.jitter_fraction;
        if jitter_span <= 0.0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let millis = (base.as_millis() as f64 + offset).max(0.0) as u64;
        Duration::from_millis(millis)
    }

    /// Attempt cap for a failure class
    pub fn attempt_cap(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::Unknown => self.config.max_attempts.min(UNKNOWN_ATTEMPT_CAP),
            _ => self.config.max_attempts,
        }
    }

    /// Whether a target that has consumed `attempts` may try again
    pub fn may_retry(&self, class: FailureClass, attempts: u32) -> bool {
        match class {
            FailureClass::Transient | FailureClass::Unknown => {
                attempts < self.attempt_cap(class)
            }
            FailureClass::Permanent | FailureClass::Integrity => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        })
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(ErrorCategory::Io), FailureClass::Transient);
        assert_eq!(classify(ErrorCategory::AccessDenied), FailureClass::Permanent);
        assert_eq!(classify(ErrorCategory::PathNotFound), FailureClass::Permanent);
        assert_eq!(classify(ErrorCategory::StorageFull), FailureClass::Transient);
        assert_eq!(
            classify(ErrorCategory::InvariantViolation),
            FailureClass::Integrity
        );
        assert_eq!(classify(ErrorCategory::Uncategorized), FailureClass::Unknown);
    }

    #[test]
    fn test_io_categorization() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            categorize_io(&Error::new(ErrorKind::PermissionDenied, "no")),
            ErrorCategory::AccessDenied
        );
        assert_eq!(
            categorize_io(&Error::new(ErrorKind::NotFound, "gone")),
            ErrorCategory::PathNotFound
        );
        assert_eq!(
            categorize_io(&Error::from_raw_os_error(28)),
            ErrorCategory::StorageFull
        );
    }

    #[test]
    fn test_backoff_respects_ceiling() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(10_000));
    }

    #[test]
    fn test_integrity_never_retries() {
        let policy = policy();
        assert!(!policy.may_retry(FailureClass::Integrity, 0));
        assert!(!policy.may_retry(FailureClass::Permanent, 0));
    }

    #[test]
    fn test_unknown_has_low_cap() {
        let policy = policy();
        assert!(policy.may_retry(FailureClass::Unknown, 1));
        assert!(!policy.may_retry(FailureClass::Unknown, 2));
        assert!(policy.may_retry(FailureClass::Transient, 4));
        assert!(!policy.may_retry(FailureClass::Transient, 5));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = policy();
        for _ in 0..100 {
            let jittered = policy.delay_with_jitter(3, ErrorCategory::Io);
            let base = policy.delay_for_attempt(3).as_millis() as f64;
            let delta = (jittered.as_millis() as f64 - base).abs();
            assert!(delta <= base * 0.2 + 1.0);
        }
    }

    proptest! {
        #[test]
        fn prop_pre_jitter_delays_non_decreasing(
            base in 1u64..5_000,
            ceiling in 5_000u64..600_000,
            multiplier in 1.0f64..4.0,
            attempts in 2u32..20,
        ) {
            let policy = RetryPolicy::new(RetryConfig {
                max_attempts: 10,
                base_delay_ms: base,
                max_delay_ms: ceiling,
                multiplier,
                jitter_fraction: 0.0,
            });
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
