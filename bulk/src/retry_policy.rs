use std::time::Duration;

use docdb_core::status::Status;

/// Retry budget for server throttling (429) responses.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleRetrySetting {
    pub max_retry_attempts_on_throttled_requests: u32,
    /// Cumulative cap across all throttle waits of one operation.
    pub max_retry_wait_time: Duration,
}

impl Default for ThrottleRetrySetting {
    fn default() -> Self {
        Self {
            max_retry_attempts_on_throttled_requests: 9,
            max_retry_wait_time: Duration::from_secs(30),
        }
    }
}

/// What the dispatcher should do with one per-operation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Surface the result to the caller as-is.
    Complete,
    /// Send the operation back through routing into a streamer.
    Retry {
        delay: Duration,
        refresh_routing: bool,
    },
}

const MAX_PARTITION_RANGE_GONE_ATTEMPTS: u32 = 3;

/// Per-operation retry state, carried across rebatches and never shared.
///
/// Two layers, evaluated outer to inner: stale partition routing first,
/// then server throttling. Anything else is terminal for this policy.
#[derive(Clone, Debug)]
pub(crate) struct RetryState {
    setting: ThrottleRetrySetting,
    throttle_attempts: u32,
    cumulative_wait: Duration,
    range_gone_attempts: u32,
}

impl RetryState {
    pub(crate) fn new(setting: ThrottleRetrySetting) -> Self {
        Self {
            setting,
            throttle_attempts: 0,
            cumulative_wait: Duration::ZERO,
            range_gone_attempts: 0,
        }
    }

    pub(crate) fn throttle_attempts(&self) -> u32 {
        self.throttle_attempts
    }

    pub(crate) fn decide(&mut self, status: &Status) -> RetryDecision {
        if status.is_partition_range_gone() {
            if self.range_gone_attempts >= MAX_PARTITION_RANGE_GONE_ATTEMPTS {
                return RetryDecision::Complete;
            }
            self.range_gone_attempts += 1;
            return RetryDecision::Retry {
                delay: Duration::ZERO,
                refresh_routing: true,
            };
        }

        if status.is_throttled() {
            let delay = status.retry_after().unwrap_or(Duration::ZERO);
            if self.throttle_attempts >= self.setting.max_retry_attempts_on_throttled_requests
                || self.cumulative_wait + delay > self.setting.max_retry_wait_time
            {
                return RetryDecision::Complete;
            }
            self.throttle_attempts += 1;
            self.cumulative_wait += delay;
            return RetryDecision::Retry {
                delay,
                refresh_routing: false,
            };
        }

        RetryDecision::Complete
    }
}
