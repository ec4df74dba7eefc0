//! Durable notification outbox
//!
//! Enqueue writes are deduped on (email_type, order_id, to_email); delivery
//! happens in a periodic sweep so a crash between enqueue and send loses
//! nothing. Every send attempt is ledgered as an `email_sending` retry row.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::db::email_queue::{self, NewEmail};
use crate::db::error_logs::{self, ErrorEvent};
use crate::db::retry_logs::{self, NewAttempt, retry_type};
use crate::email::{self, MailTransport};
use crate::error::ServiceResult;
use crate::retry::BackoffPolicy;

pub mod email_type {
    pub const LICENSE_KEYS: &str = "license_key_delivery";
    pub const PAYMENT_FAILED: &str = "payment_failed";
}

pub mod priority {
    pub const HIGH: i64 = 1;
    pub const NORMAL: i64 = 2;
}

/// A `sending` claim older than this is from a crashed sweep and gets
/// reclaimed.
const STALE_SENDING_TTL_MS: i64 = 10 * 60 * 1000;

/// Queue the consolidated license-key email for a completed order.
/// Safe to call on every completion check: the dedup key collapses repeats.
pub async fn enqueue_license_keys(
    pool: &SqlitePool,
    order_id: i64,
    to_email: &str,
    keys: &[(String, String)],
    now: i64,
) -> ServiceResult<bool> {
    let (subject, html, text) = email::license_keys_email(order_id, keys);
    let queued = email_queue::enqueue(
        pool,
        &NewEmail {
            to_email,
            subject: &subject,
            html_body: &html,
            text_body: Some(&text),
            priority: priority::HIGH,
            email_type: email_type::LICENSE_KEYS,
            order_id: Some(order_id),
            max_retries: 3,
            now,
        },
    )
    .await?;
    if queued {
        tracing::info!(order_id = order_id, "License-key email queued");
    }
    Ok(queued)
}

pub async fn enqueue_payment_failed(
    pool: &SqlitePool,
    order_id: i64,
    to_email: &str,
    now: i64,
) -> ServiceResult<bool> {
    let (subject, html, text) = email::payment_failed_email(order_id);
    email_queue::enqueue(
        pool,
        &NewEmail {
            to_email,
            subject: &subject,
            html_body: &html,
            text_body: Some(&text),
            priority: priority::NORMAL,
            email_type: email_type::PAYMENT_FAILED,
            order_id: Some(order_id),
            max_retries: 3,
            now,
        },
    )
    .await?;
    Ok(true)
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepStats {
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Deliver one batch of due emails. `now_ms` is passed in so schedules are
/// driven by the caller's clock.
pub async fn sweep(
    pool: &SqlitePool,
    mailer: &Arc<dyn MailTransport>,
    policy: &BackoffPolicy,
    batch_size: i64,
    now_ms: i64,
) -> ServiceResult<SweepStats> {
    let mut stats = SweepStats::default();

    let reclaimed =
        email_queue::reclaim_stale_sending(pool, now_ms - STALE_SENDING_TTL_MS, now_ms).await?;
    if reclaimed > 0 {
        tracing::warn!(count = reclaimed, "Reclaimed emails stranded in sending");
    }

    for item in email_queue::due_batch(pool, now_ms, batch_size).await? {
        // Another sweep may have claimed it in the meantime.
        if email_queue::claim_sending(pool, item.id, now_ms).await? == 0 {
            continue;
        }

        let attempt_number = item.attempts + 1;
        let row_id = retry_logs::start_attempt(
            pool,
            &NewAttempt {
                order_id: item.order_id,
                order_item_id: None,
                provider_order_id: None,
                retry_type: retry_type::EMAIL_SENDING,
                attempt_number,
                max_attempts: item.max_retries,
                metadata: Some(&serde_json::json!({
                    "email_id": item.id,
                    "email_type": item.email_type,
                })),
                now: now_ms,
            },
        )
        .await?;

        match mailer
            .send(
                &item.to_email,
                &item.subject,
                &item.html_body,
                item.text_body.as_deref(),
            )
            .await
        {
            Ok(()) => {
                email_queue::mark_sent(pool, item.id, now_ms).await?;
                retry_logs::finish_attempt(pool, row_id, "success", None, None, None, now_ms)
                    .await?;
                stats.sent += 1;
            }
            Err(e) => {
                let message = e.to_string();
                if attempt_number >= item.max_retries {
                    email_queue::mark_failed(pool, item.id, &message, now_ms).await?;
                    retry_logs::finish_attempt(
                        pool,
                        row_id,
                        "failed",
                        None,
                        Some(&message),
                        None,
                        now_ms,
                    )
                    .await?;
                    error_logs::log_error(
                        pool,
                        &ErrorEvent {
                            error_type: "email_delivery",
                            error_code: None,
                            severity: error_logs::severity::ERROR,
                            source_system: Some("email"),
                            message: &message,
                            context: Some(&serde_json::json!({
                                "email_id": item.id,
                                "email_type": item.email_type,
                                "order_id": item.order_id,
                            })),
                            requires_manual_review: true,
                        },
                        now_ms,
                    )
                    .await?;
                    tracing::error!(
                        email_id = item.id,
                        "Email delivery abandoned after {attempt_number} attempts"
                    );
                    stats.failed += 1;
                } else {
                    let next_retry_at =
                        now_ms + policy.delay(attempt_number as u32 + 1).as_millis() as i64;
                    email_queue::mark_retry(pool, item.id, next_retry_at, &message, now_ms)
                        .await?;
                    retry_logs::finish_attempt(
                        pool,
                        row_id,
                        "failed",
                        None,
                        Some(&message),
                        Some(next_retry_at),
                        now_ms,
                    )
                    .await?;
                    stats.retried += 1;
                }
            }
        }
    }

    if stats.sent + stats.retried + stats.failed > 0 {
        tracing::info!(
            sent = stats.sent,
            retried = stats.retried,
            failed = stats.failed,
            "Email sweep finished"
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::email::MailError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records sends; fails the first `fail_first` attempts.
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
        fail_first: AtomicU32,
    }

    impl RecordingMailer {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(fail_first),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send(
            &self,
            to: &str,
            subject: &str,
            _html: &str,
            _text: Option<&str>,
        ) -> Result<(), MailError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MailError::Send("smtp unavailable".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    fn zero_policy() -> BackoffPolicy {
        BackoffPolicy::immediate(3)
    }

    #[tokio::test]
    async fn enqueue_dedups_on_type_order_recipient() {
        let pool = testing::pool().await;
        let keys = vec![("game-1".to_string(), "KEY-1".to_string())];

        for _ in 0..5 {
            enqueue_license_keys(&pool, 42, "buyer@example.com", &keys, 1000)
                .await
                .unwrap();
        }

        let rows = email_queue::due_batch(&pool, 1000, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].email_type, email_type::LICENSE_KEYS);

        // Different type for the same order is its own row.
        enqueue_payment_failed(&pool, 42, "buyer@example.com", 1000)
            .await
            .unwrap();
        let rows = email_queue::due_batch(&pool, 1000, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn batch_orders_by_priority_then_age() {
        let pool = testing::pool().await;
        let keys = vec![("game-1".to_string(), "KEY-1".to_string())];

        // Older normal-priority email first, then a newer high-priority one.
        enqueue_payment_failed(&pool, 1, "a@example.com", 1000)
            .await
            .unwrap();
        enqueue_payment_failed(&pool, 2, "b@example.com", 1500)
            .await
            .unwrap();
        enqueue_license_keys(&pool, 3, "c@example.com", &keys, 2000)
            .await
            .unwrap();

        let rows = email_queue::due_batch(&pool, 3000, 10).await.unwrap();
        let order: Vec<&str> = rows.iter().map(|r| r.to_email.as_str()).collect();
        assert_eq!(order, vec!["c@example.com", "a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn successful_sweep_marks_sent_and_ledgers() {
        let pool = testing::pool().await;
        let mailer = RecordingMailer::new(0);
        let keys = vec![("game-1".to_string(), "KEY-1".to_string())];
        enqueue_license_keys(&pool, 42, "buyer@example.com", &keys, 1000)
            .await
            .unwrap();

        let transport: Arc<dyn MailTransport> = mailer.clone();
        let stats = sweep(&pool, &transport, &zero_policy(), 10, 2000)
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(mailer.sent().len(), 1);

        let rows = sqlx::query_as::<_, crate::db::retry_logs::RetryLog>(
            "SELECT * FROM retry_logs WHERE retry_type = 'email_sending'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "success");

        // Nothing left due; a second sweep is a no-op.
        let stats = sweep(&pool, &transport, &zero_policy(), 10, 3000)
            .await
            .unwrap();
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn failed_send_backs_off_until_due() {
        let pool = testing::pool().await;
        let mailer = RecordingMailer::new(1);
        enqueue_payment_failed(&pool, 7, "buyer@example.com", 1000)
            .await
            .unwrap();

        let policy = BackoffPolicy {
            base: std::time::Duration::from_secs(300),
            multiplier: 3,
            cap: std::time::Duration::from_secs(3600),
            max_attempts: 3,
        };

        let transport: Arc<dyn MailTransport> = mailer.clone();
        let stats = sweep(&pool, &transport, &policy, 10, 1000).await.unwrap();
        assert_eq!(stats.retried, 1);

        // Not due again until the backoff elapses.
        let stats = sweep(&pool, &transport, &policy, 10, 1001).await.unwrap();
        assert_eq!(stats, SweepStats::default());

        // delay(2) = 900s after the failing sweep.
        let stats = sweep(&pool, &transport, &policy, 10, 1000 + 900_001)
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn stranded_sending_rows_are_reclaimed_and_delivered() {
        let pool = testing::pool().await;
        let mailer = RecordingMailer::new(0);
        enqueue_payment_failed(&pool, 11, "buyer@example.com", 1000)
            .await
            .unwrap();

        // Simulate a sweep that claimed the row and died before finishing.
        sqlx::query("UPDATE email_queue SET status = 'sending', updated_at = 1000 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let transport: Arc<dyn MailTransport> = mailer.clone();

        // Fresh claims are left alone.
        let stats = sweep(&pool, &transport, &zero_policy(), 10, 2000).await.unwrap();
        assert_eq!(stats, SweepStats::default());
        let email = email_queue::find_by_id(&pool, 1).await.unwrap().unwrap();
        assert_eq!(email.status, "sending");

        // Past the stale TTL the row is reclaimed and delivered.
        let stats = sweep(&pool, &transport, &zero_policy(), 10, 1000 + 11 * 60 * 1000)
            .await
            .unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(mailer.sent().len(), 1);
        let email = email_queue::find_by_id(&pool, 1).await.unwrap().unwrap();
        assert_eq!(email.status, "sent");
    }

    #[tokio::test]
    async fn exhausted_email_fails_terminally_with_error_log() {
        let pool = testing::pool().await;
        let mailer = RecordingMailer::new(u32::MAX);
        enqueue_payment_failed(&pool, 9, "buyer@example.com", 1000)
            .await
            .unwrap();

        let transport: Arc<dyn MailTransport> = mailer.clone();
        let mut now = 1000;
        let mut failed = 0;
        for _ in 0..5 {
            let stats = sweep(&pool, &transport, &zero_policy(), 10, now).await.unwrap();
            failed += stats.failed;
            now += 10_000_000;
        }
        assert_eq!(failed, 1);

        let email = email_queue::find_by_id(&pool, 1).await.unwrap().unwrap();
        assert_eq!(email.status, "failed");
        assert_eq!(email.attempts, 3);

        let errors = error_logs::list_unresolved(&pool, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "email_delivery");
        assert_eq!(errors[0].requires_manual_review, 1);
    }
}
