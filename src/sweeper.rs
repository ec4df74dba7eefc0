//! Background sweeps: pending-order expiry and retention pruning

use sqlx::SqlitePool;

use crate::db::{email_queue, orders, retry_logs};
use crate::error::ServiceResult;

/// Pending orders older than this are expired.
pub const PENDING_ORDER_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Retry ledger rows are kept for 30 hours.
pub const RETRY_LOG_RETENTION_MS: i64 = 30 * 60 * 60 * 1000;

/// Sent/failed emails are kept for 30 days.
pub const EMAIL_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Expire orders that sat in `pending` past the TTL. Idempotent; takes
/// `now_ms` so the cutoff is the caller's clock.
pub async fn expire_pending_orders(pool: &SqlitePool, now_ms: i64) -> ServiceResult<u64> {
    let expired = orders::expire_stale(pool, now_ms - PENDING_ORDER_TTL_MS, now_ms).await?;
    if expired > 0 {
        tracing::info!(count = expired, "Expired stale pending orders");
    }
    Ok(expired)
}

/// Drop ledger rows and terminal emails past retention.
pub async fn prune_retention(pool: &SqlitePool, now_ms: i64) -> ServiceResult<(u64, u64)> {
    let retry_rows = retry_logs::prune_started_before(pool, now_ms - RETRY_LOG_RETENTION_MS).await?;
    let email_rows =
        email_queue::prune_terminal_before(pool, now_ms - EMAIL_RETENTION_MS).await?;
    if retry_rows + email_rows > 0 {
        tracing::info!(
            retry_rows = retry_rows,
            email_rows = email_rows,
            "Pruned retention data"
        );
    }
    Ok((retry_rows, email_rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::orders::status;
    use crate::db::testing;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    async fn seed_order_at(pool: &SqlitePool, user_id: i64, created_at: i64) -> i64 {
        orders::create(pool, user_id, 19.99, "EUR", created_at)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn only_stale_pending_orders_expire() {
        let pool = testing::pool().await;
        let user_id = testing::seed_user(&pool, "buyer@example.com").await;
        let now = 100 * HOUR_MS;

        let stale = seed_order_at(&pool, user_id, now - 25 * HOUR_MS).await;
        let fresh = seed_order_at(&pool, user_id, now - HOUR_MS).await;

        let expired = expire_pending_orders(&pool, now).await.unwrap();
        assert_eq!(expired, 1);

        let stale = orders::find_by_id(&pool, stale).await.unwrap().unwrap();
        assert_eq!(stale.status, status::EXPIRED);
        let fresh = orders::find_by_id(&pool, fresh).await.unwrap().unwrap();
        assert_eq!(fresh.status, status::PENDING);

        // Second pass finds nothing.
        assert_eq!(expire_pending_orders(&pool, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_pending_orders_never_expire() {
        let pool = testing::pool().await;
        let user_id = testing::seed_user(&pool, "buyer@example.com").await;
        let now = 100 * HOUR_MS;

        let paid = seed_order_at(&pool, user_id, now - 48 * HOUR_MS).await;
        orders::mark_paid(&pool, paid, now - 47 * HOUR_MS).await.unwrap();
        let cancelled = seed_order_at(&pool, user_id, now - 48 * HOUR_MS).await;
        orders::cancel(&pool, cancelled, now - 47 * HOUR_MS).await.unwrap();

        assert_eq!(expire_pending_orders(&pool, now).await.unwrap(), 0);
        let paid = orders::find_by_id(&pool, paid).await.unwrap().unwrap();
        assert_eq!(paid.status, status::PAID);
        let cancelled = orders::find_by_id(&pool, cancelled).await.unwrap().unwrap();
        assert_eq!(cancelled.status, status::CANCELLED);
    }

    #[tokio::test]
    async fn prune_clears_old_ledger_and_emails() {
        let pool = testing::pool().await;
        let now = 1000 * HOUR_MS;

        // One old and one recent ledger row.
        for started_at in [now - 31 * HOUR_MS, now - HOUR_MS] {
            crate::db::retry_logs::start_attempt(
                &pool,
                &crate::db::retry_logs::NewAttempt {
                    order_id: None,
                    order_item_id: Some(1),
                    provider_order_id: None,
                    retry_type: crate::db::retry_logs::retry_type::KEY_RETRIEVAL,
                    attempt_number: 1,
                    max_attempts: 5,
                    metadata: None,
                    now: started_at,
                },
            )
            .await
            .unwrap();
        }

        // One sent email past retention, one recent.
        for (order_id, updated_at) in [(1, now - 31 * 24 * HOUR_MS), (2, now - HOUR_MS)] {
            sqlx::query(
                "INSERT INTO email_queue (to_email, subject, html_body, status, priority,
                        attempts, max_retries, email_type, order_id, created_at, updated_at)
                 VALUES ('a@example.com', 's', 'b', 'sent', 2, 1, 3, 'license_key_delivery', ?, ?, ?)",
            )
            .bind(order_id)
            .bind(updated_at)
            .bind(updated_at)
            .execute(&pool)
            .await
            .unwrap();
        }

        let (retry_rows, email_rows) = prune_retention(&pool, now).await.unwrap();
        assert_eq!(retry_rows, 1);
        assert_eq!(email_rows, 1);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retry_logs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining.0, 1);
    }
}
