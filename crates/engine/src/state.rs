//! Notification state machine and retry backoff.
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──ok──▶ SENT ──confirm──▶ DELIVERED ──read──▶ READ
//!    ▲                  │  │                               (in-app only)
//!    └──retry/reclaim───┘  └──budget exhausted──▶ FAILED
//! ```
//!
//! The table here only decides legality. Stores enforce it with conditional
//! updates keyed on the observed status, so concurrent writers settle on one
//! winner without any in-process lock.

use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_common::config::AppConfig;
use courier_common::types::{Channel, NotificationStatus};

use NotificationStatus::*;

/// Whether `from -> to` is a legal edge.
pub fn can_transition(from: NotificationStatus, to: NotificationStatus) -> bool {
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Sent)
            | (Processing, Pending)
            | (Processing, Failed)
            | (Sent, Delivered)
            | (Delivered, Read)
    )
}

/// Whether a notification in `status` will never change again.
pub fn is_terminal(status: NotificationStatus, channel: Channel) -> bool {
    match status {
        Failed | Read => true,
        Delivered => channel != Channel::InApp,
        _ => false,
    }
}

/// Result of recording one failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to PENDING until `next_retry_at`.
    Retry {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget spent; the notification becomes FAILED.
    Exhausted { retry_count: i32 },
}

/// Exponential backoff for failed deliveries: `base * 2^(k-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_max_retries: u32,
}

impl RetryPolicy {
    /// Upper bound accepted for a per-request retry budget.
    pub const MAX_RETRIES_LIMIT: u32 = 10;

    pub fn new(base_delay: Duration, max_delay: Duration, default_max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            default_max_retries,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_seconds),
            Duration::from_secs(config.retry_max_delay_seconds),
            config.default_max_retries,
        )
    }

    /// Delay before the attempt following the `failures`-th failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        // 2^exponent saturates instead of overflowing for absurd counts.
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what a failure at `now` does to a notification that has already
    /// failed `retry_count` times out of a `max_retries` budget.
    pub fn on_failure(
        &self,
        retry_count: i32,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        let attempt = retry_count.max(0).saturating_add(1);
        let max_retries = max_retries.max(0);

        if attempt >= max_retries {
            return FailureDecision::Exhausted {
                retry_count: attempt.min(max_retries),
            };
        }

        let delay = self.delay_for(attempt as u32);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        FailureDecision::Retry {
            retry_count: attempt,
            next_retry_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(3600), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [NotificationStatus; 6] = [Pending, Processing, Sent, Delivered, Read, Failed];

    #[test]
    fn test_legal_edges() {
        let legal = [
            (Pending, Processing),
            (Processing, Sent),
            (Processing, Pending),
            (Processing, Failed),
            (Sent, Delivered),
            (Delivered, Read),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    can_transition(from, to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in [Failed, Read] {
            for to in ALL {
                assert!(!can_transition(from, to));
            }
        }
    }

    #[test]
    fn test_delivered_is_terminal_outside_in_app() {
        assert!(is_terminal(Delivered, Channel::Email));
        assert!(!is_terminal(Delivered, Channel::InApp));
        assert!(!is_terminal(Pending, Channel::Email));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(200), 5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(4), Duration::from_secs(200));
        assert_eq!(policy.delay_for(60), Duration::from_secs(200));
    }

    #[test]
    fn test_failure_schedules_retry() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(3600), 3);
        let now = Utc::now();

        assert_eq!(
            policy.on_failure(0, 3, now),
            FailureDecision::Retry {
                retry_count: 1,
                next_retry_at: now + chrono::Duration::seconds(10),
            }
        );
        assert_eq!(
            policy.on_failure(1, 3, now),
            FailureDecision::Retry {
                retry_count: 2,
                next_retry_at: now + chrono::Duration::seconds(20),
            }
        );
    }

    #[test]
    fn test_third_failure_exhausts_budget_of_three() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(2, 3, Utc::now()),
            FailureDecision::Exhausted { retry_count: 3 }
        );
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(0, 0, Utc::now()),
            FailureDecision::Exhausted { retry_count: 0 }
        );
    }

    #[test]
    fn test_retry_count_never_exceeds_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut retry_count = 0;
        loop {
            match policy.on_failure(retry_count, 5, now) {
                FailureDecision::Retry { retry_count: next, .. } => {
                    assert!(next > retry_count);
                    retry_count = next;
                }
                FailureDecision::Exhausted { retry_count: last } => {
                    assert_eq!(last, 5);
                    break;
                }
            }
        }
    }
}
