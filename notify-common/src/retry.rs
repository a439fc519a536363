//! # Retry
//!
//! Module providing a `RetryPolicy` to schedule retries of temporarily failed notifications, and
//! the decision of whether a failure is still retryable at all.
use std::time;

use chrono::{DateTime, Utc};

use crate::notification::NotificationState;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine when a failed notification becomes eligible again.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every recorded retry.
    pub backoff_coefficient: u32,
    /// The unit interval, scaled by `backoff_coefficient ^ retry_count`.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the backoff for a notification that has now failed `retry_count` times.
    /// With the default policy this is `2 ^ retry_count` seconds.
    pub fn retry_interval(&self, retry_count: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(retry_count);
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Decide what a failure does to a notification that has failed `retry_count` times so far.
    ///
    /// A failure is permanent when the caller says so or when the retry budget is already spent.
    /// Otherwise the retry count goes up by one and the notification is rescheduled.
    pub fn on_failure(
        &self,
        retry_count: i32,
        max_retry: i32,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        if permanent || retry_count >= max_retry {
            return FailureDecision::Permanent;
        }

        let retry_count = retry_count.saturating_add(1);
        let interval = self.retry_interval(u32::try_from(retry_count).unwrap_or(0));
        let next_retry_at = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|interval| now.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        FailureDecision::Retry {
            retry_count,
            next_retry_at,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// The outcome of recording a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    Permanent,
}

impl FailureDecision {
    pub fn state(&self) -> NotificationState {
        match self {
            FailureDecision::Retry { .. } => NotificationState::FailedTemp,
            FailureDecision::Permanent => NotificationState::FailedPerm,
        }
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
