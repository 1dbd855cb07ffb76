//! Bounded exponential backoff.
//!
//! One explicit retry primitive instead of ad hoc sleep loops: a fixed base
//! delay, doubling per attempt, a fixed attempt budget, and a typed
//! exhaustion error. [`retry_until_complete`] covers eventually-consistent
//! secondary endpoints where a detail record lags the listing that named it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

/// Attempt budget and delay schedule for retried operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based; the first attempt has no
    /// delay): `base * multiplier^(attempt - 2)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt - 2))
    }
}

/// Run `op`, retrying transient errors per the policy. Non-transient errors
/// surface immediately; exhausting the budget yields
/// [`SyncError::RetriesExhausted`].
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        tokio::time::sleep(policy.delay_for(attempt)).await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                warn!(attempt, max_attempts = policy.max_attempts, error = %err, "transient error");
                if attempt >= policy.max_attempts {
                    return Err(SyncError::RetriesExhausted {
                        attempts: attempt,
                        detail: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Re-poll a lookup until it covers every wanted id.
///
/// Some sources expose a detail endpoint that lags the primary listing
/// (call metadata exists before its transcript is queryable). Exhausting
/// the budget fails loudly, naming the still-missing ids, rather than
/// silently omitting them.
pub async fn retry_until_complete<T, F, Fut>(
    policy: RetryPolicy,
    wanted_ids: &[String],
    mut lookup: F,
) -> Result<HashMap<String, T>, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HashMap<String, T>, SyncError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        tokio::time::sleep(policy.delay_for(attempt)).await;
        let found = lookup().await?;

        let missing: Vec<&String> = wanted_ids
            .iter()
            .filter(|id| !found.contains_key(*id))
            .collect();
        if missing.is_empty() {
            return Ok(found);
        }

        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            missing = ?missing,
            "detail lookup incomplete"
        );
        if attempt >= policy.max_attempts {
            return Err(SyncError::RetriesExhausted {
                attempts: attempt,
                detail: format!(
                    "detail lookup still missing ids after {} attempts: {}",
                    attempt,
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2,
        }
    }

    #[test]
    fn delay_schedule_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(fast_policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::Upstream("flaky".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_is_typed() {
        let err = retry(fast_policy(3), || async {
            Err::<(), _>(SyncError::Upstream("always down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry(fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SyncError::Configuration("bad".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn until_complete_names_missing_ids() {
        let wanted = vec!["a".to_string(), "b".to_string()];
        let err = retry_until_complete(fast_policy(2), &wanted, || async {
            let mut found = HashMap::new();
            found.insert("a".to_string(), 1u32);
            Ok(found)
        })
        .await
        .unwrap_err();
        match err {
            SyncError::RetriesExhausted { detail, .. } => assert!(detail.contains('b')),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn until_complete_returns_once_covered() {
        let calls = AtomicU32::new(0);
        let wanted = vec!["a".to_string(), "b".to_string()];
        let found = retry_until_complete(fast_policy(5), &wanted, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut found = HashMap::new();
                found.insert("a".to_string(), 1u32);
                if n >= 1 {
                    found.insert("b".to_string(), 2u32);
                }
                Ok(found)
            }
        })
        .await
        .unwrap();
        assert_eq!(found.len(), 2);
    }
}
