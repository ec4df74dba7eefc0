//! Bounded retries with a persisted attempt ledger
//!
//! `run_retries` wraps an external call: every attempt opens an `in_progress`
//! retry_logs row before the call runs and finalizes it afterwards. Callers
//! probe the operation once themselves (un-ledgered) and hand over to the
//! wrapper only when the probe came back retryable, so the ledger ends up
//! holding exactly the retry attempts.

use std::future::Future;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::db::retry_logs::{self, NewAttempt};
use crate::db::now_ms;
use crate::error::ServiceResult;

/// Exponential backoff: delay(n) = base × multiplier^(n−1), capped.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Provider create/pay/fetch retries: 30s, 60s, 120s, ... capped at 10 min.
    pub fn provider(max_attempts: u32) -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2,
            cap: Duration::from_secs(600),
            max_attempts,
        }
    }

    /// Email delivery: 5 min, 15 min, 45 min.
    pub fn email() -> Self {
        Self {
            base: Duration::from_secs(300),
            multiplier: 3,
            cap: Duration::from_secs(3600),
            max_attempts: 3,
        }
    }

    /// On-demand key fetch from the license-keys endpoint: three quick tries.
    pub fn on_demand() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 1,
            cap: Duration::from_secs(2),
            max_attempts: 3,
        }
    }

    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base: Duration::ZERO,
            multiplier: 1,
            cap: Duration::ZERO,
            max_attempts,
        }
    }

    /// Delay before attempt `n` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exp);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// How a single attempt resolved.
pub enum Outcome<T> {
    Success(T),
    /// Transient failure, worth another attempt
    Retry {
        code: Option<String>,
        message: String,
    },
    /// Permanent failure, retrying cannot help
    Fatal {
        code: Option<String>,
        message: String,
    },
}

/// Final verdict after the retry loop.
pub enum RetryOutcome<T> {
    Done(T),
    Exhausted {
        code: Option<String>,
        message: String,
    },
    Fatal {
        code: Option<String>,
        message: String,
    },
}

/// Ledger identity shared by every attempt of one logical operation.
pub struct AttemptContext {
    pub retry_type: &'static str,
    pub order_id: Option<i64>,
    pub order_item_id: Option<i64>,
    pub provider_order_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Run `op` up to `policy.max_attempts` times with backoff, ledgering each
/// attempt. The closure receives the 1-based attempt number.
pub async fn run_retries<T, F, Fut>(
    pool: &SqlitePool,
    ctx: &AttemptContext,
    policy: &BackoffPolicy,
    mut op: F,
) -> ServiceResult<RetryOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    let mut last_code: Option<String> = None;
    let mut last_message = String::new();

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let row_id = retry_logs::start_attempt(
            pool,
            &NewAttempt {
                order_id: ctx.order_id,
                order_item_id: ctx.order_item_id,
                provider_order_id: ctx.provider_order_id.as_deref(),
                retry_type: ctx.retry_type,
                attempt_number: attempt as i64,
                max_attempts: policy.max_attempts as i64,
                metadata: ctx.metadata.as_ref(),
                now: now_ms(),
            },
        )
        .await?;

        match op(attempt).await {
            Outcome::Success(value) => {
                retry_logs::finish_attempt(pool, row_id, "success", None, None, None, now_ms())
                    .await?;
                tracing::info!(
                    retry_type = ctx.retry_type,
                    attempt = attempt,
                    "Retry attempt succeeded"
                );
                return Ok(RetryOutcome::Done(value));
            }
            Outcome::Retry { code, message } => {
                let next_retry_at = if attempt < policy.max_attempts {
                    Some(now_ms() + policy.delay(attempt + 1).as_millis() as i64)
                } else {
                    None
                };
                retry_logs::finish_attempt(
                    pool,
                    row_id,
                    "failed",
                    code.as_deref(),
                    Some(&message),
                    next_retry_at,
                    now_ms(),
                )
                .await?;
                tracing::warn!(
                    retry_type = ctx.retry_type,
                    attempt = attempt,
                    code = code.as_deref().unwrap_or(""),
                    "Retry attempt failed"
                );
                last_code = code;
                last_message = message;
            }
            Outcome::Fatal { code, message } => {
                retry_logs::finish_attempt(
                    pool,
                    row_id,
                    "failed",
                    code.as_deref(),
                    Some(&message),
                    None,
                    now_ms(),
                )
                .await?;
                tracing::error!(
                    retry_type = ctx.retry_type,
                    attempt = attempt,
                    code = code.as_deref().unwrap_or(""),
                    "Fatal failure, retries abandoned"
                );
                return Ok(RetryOutcome::Fatal { code, message });
            }
        }
    }

    Ok(RetryOutcome::Exhausted {
        code: last_code,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(30),
            multiplier: 2,
            cap: Duration::from_secs(600),
            max_attempts: 10,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(6), Duration::from_secs(600));
        assert_eq!(policy.delay(10), Duration::from_secs(600));
    }

    #[test]
    fn flat_backoff_stays_flat() {
        let policy = BackoffPolicy::on_demand();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    fn ctx() -> AttemptContext {
        AttemptContext {
            retry_type: retry_logs::retry_type::KEY_RETRIEVAL,
            order_id: Some(1),
            order_item_id: Some(7),
            provider_order_id: Some("prov-1".into()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn success_after_failures_ledgers_every_attempt() {
        let pool = testing::pool().await;
        let calls = AtomicU32::new(0);

        let outcome = run_retries(&pool, &ctx(), &BackoffPolicy::immediate(5), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Outcome::Retry {
                        code: Some("ORD03".into()),
                        message: "not ready".into(),
                    }
                } else {
                    Outcome::Success("KEY-123".to_string())
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, RetryOutcome::Done(ref k) if k == "KEY-123"));

        let rows = retry_logs::list_for_item(&pool, 7, retry_logs::retry_type::KEY_RETRIEVAL)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].attempt_number, 1);
        assert_eq!(rows[2].status, "success");
        assert_eq!(rows[2].attempt_number, 3);
    }

    #[tokio::test]
    async fn exhaustion_ledgers_max_attempts_rows() {
        let pool = testing::pool().await;

        let outcome: RetryOutcome<String> =
            run_retries(&pool, &ctx(), &BackoffPolicy::immediate(4), |_| async {
                Outcome::Retry {
                    code: Some("ORD03".into()),
                    message: "not ready".into(),
                }
            })
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));

        let rows = retry_logs::list_for_item(&pool, 7, retry_logs::retry_type::KEY_RETRIEVAL)
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.status == "failed"));
        assert!(rows.last().unwrap().next_retry_at.is_none());
    }

    #[tokio::test]
    async fn fatal_stops_immediately() {
        let pool = testing::pool().await;

        let outcome: RetryOutcome<String> =
            run_retries(&pool, &ctx(), &BackoffPolicy::immediate(5), |_| async {
                Outcome::Fatal {
                    code: Some("ORD01".into()),
                    message: "invalid order".into(),
                }
            })
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Fatal { .. }));

        let rows = retry_logs::list_for_item(&pool, 7, retry_logs::retry_type::KEY_RETRIEVAL)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
