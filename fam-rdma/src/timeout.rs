//! The two-level completion-wait retry policy from spec.md §4.2/§5: a
//! tight spin for the common case where the completion is already
//! sitting in the queue, falling back to a coarse, millisecond-stepped
//! wait, bounded in aggregate.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tight_retries: u32,
    pub coarse_step: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            tight_retries: 64,
            coarse_step: Duration::from_millis(10),
            // "accumulate up to one hour of waits before raising Fam_Timeout_Exception"
            max_wait: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
impl RetryPolicy {
    /// A policy with the same shape but a wait bound short enough for
    /// tests that deliberately exercise the timeout path.
    pub fn fast_for_tests() -> Self {
        RetryPolicy {
            tight_retries: 4,
            coarse_step: Duration::from_millis(1),
            max_wait: Duration::from_millis(50),
        }
    }
}
