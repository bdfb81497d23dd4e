//! Bounded fixed-delay retry for transient cloud errors.
//!
//! Clouds are eventually consistent around resource creation: a tag read
//! issued right after a create can report the entity as missing. Those
//! reads are retried with a fixed delay up to a bounded attempt count;
//! exhausting the budget is fatal.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::cloud::CloudError;

/// Retry parameters: how many attempts in total, and how long to sleep
/// between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy for eventual-consistency tag reads/writes.
    pub fn tags() -> Self {
        RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }

    /// Policy for long-running state polls (volume attach, instance state).
    pub fn poll() -> Self {
        RetryPolicy {
            max_attempts: 30,
            delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the attempt budget
/// is exhausted. `classify` decides whether an error is worth retrying.
pub fn retry<T, C, F>(
    policy: RetryPolicy,
    what: &str,
    classify: C,
    mut op: F,
) -> Result<T, CloudError>
where
    C: Fn(&CloudError) -> bool,
    F: FnMut() -> Result<T, CloudError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(err) if classify(&err) => {
                if attempt >= policy.max_attempts {
                    return Err(CloudError::RetriesExhausted {
                        what: what.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                debug!(what, attempt, error = %err, "retrying after transient error");
                thread::sleep(policy.delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn succeeds_after_transient_errors() {
        let mut calls = 0;
        let result = retry(
            fast(),
            "get tags",
            CloudError::is_eventual_consistency,
            || {
                calls += 1;
                if calls < 4 {
                    Err(CloudError::EventualConsistency {
                        message: "entity not yet visible".into(),
                    })
                } else {
                    Ok(calls)
                }
            },
        );
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls, 4);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry(
            fast(),
            "get tags",
            CloudError::is_eventual_consistency,
            || {
                calls += 1;
                Err(CloudError::Api {
                    message: "access denied".into(),
                })
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhausted_budget_is_fatal_with_attempt_count() {
        let result: Result<(), _> = retry(
            fast(),
            "get tags",
            CloudError::is_eventual_consistency,
            || {
                Err(CloudError::EventualConsistency {
                    message: "still not there".into(),
                })
            },
        );
        match result.unwrap_err() {
            CloudError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_tag_policy_matches_consistency_window() {
        let policy = RetryPolicy::tags();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn default_poll_policy_is_bounded() {
        let policy = RetryPolicy::poll();
        assert_eq!(policy.max_attempts, 30);
        assert_eq!(policy.delay, Duration::from_secs(10));
    }
}
