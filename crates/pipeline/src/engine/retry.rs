//! Per-error-class retry policies.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ErrorClass;

/// Backoff policy for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries allowed after the first failure.
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub initial_interval: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_interval,
            multiplier,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `initial_interval * multiplier^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(if secs.is_sign_negative() {
            Duration::ZERO
        } else {
            Duration::MAX
        })
    }
}

/// Which stage of the run a retry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryScope {
    Transform,
    Catalog,
}

impl std::fmt::Display for RetryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform => write!(f, "transform"),
            Self::Catalog => write!(f, "catalog"),
        }
    }
}

/// Retry lookup tables for the transform and catalog stages.
///
/// Classes without an entry are not retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub transform: HashMap<ErrorClass, RetryPolicy>,
    pub catalog: HashMap<ErrorClass, RetryPolicy>,
}

impl RetryPolicies {
    pub fn policy_for(&self, scope: RetryScope, class: ErrorClass) -> Option<RetryPolicy> {
        let table = match scope {
            RetryScope::Transform => &self.transform,
            RetryScope::Catalog => &self.catalog,
        };
        table.get(&class).copied()
    }

    /// Tables with no entries: every error escalates immediately.
    pub fn none() -> Self {
        Self {
            transform: HashMap::new(),
            catalog: HashMap::new(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let transform = HashMap::from([
            (
                ErrorClass::ConcurrencyLimitExceeded,
                RetryPolicy::new(5, Duration::from_secs(60), 1.5),
            ),
            (
                ErrorClass::InternalServiceError,
                RetryPolicy::new(2, Duration::from_secs(30), 2.0),
            ),
        ]);
        let catalog = HashMap::from([
            (
                ErrorClass::AlreadyRunning,
                RetryPolicy::new(3, Duration::from_secs(60), 1.5),
            ),
            (
                ErrorClass::OperationTimeout,
                RetryPolicy::new(2, Duration::from_secs(30), 2.0),
            ),
        ]);
        Self { transform, catalog }
    }
}

/// Attempt counters for one scope of one run.
///
/// Each error class counts independently, so exhausting one class's budget
/// does not affect another.
#[derive(Debug)]
pub struct RetryTracker {
    scope: RetryScope,
    policies: RetryPolicies,
    attempts: HashMap<ErrorClass, u32>,
}

impl RetryTracker {
    pub fn new(scope: RetryScope, policies: &RetryPolicies) -> Self {
        Self {
            scope,
            policies: policies.clone(),
            attempts: HashMap::new(),
        }
    }

    pub fn scope(&self) -> RetryScope {
        self.scope
    }

    /// Register a failure of `class`.
    ///
    /// Returns the retry number and the delay to wait before it, or `None`
    /// when the class is not retryable or its budget is spent.
    pub fn next_retry(&mut self, class: ErrorClass) -> Option<(u32, Duration)> {
        let policy = self.policies.policy_for(self.scope, class)?;
        let used = self.attempts.entry(class).or_insert(0);
        if *used >= policy.max_attempts {
            return None;
        }
        *used += 1;
        Some((*used, policy.delay_for(*used)))
    }

    /// Retries consumed so far for `class`.
    pub fn attempts(&self, class: ErrorClass) -> u32 {
        self.attempts.get(&class).copied().unwrap_or(0)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
