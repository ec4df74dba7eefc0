//! Durable email outbox queries

use sqlx::SqlitePool;

use crate::error::ServiceResult;

pub mod status {
    pub const PENDING: &str = "pending";
    pub const SENDING: &str = "sending";
    pub const SENT: &str = "sent";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedEmail {
    pub id: i64,
    pub to_email: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<i64>,
    pub email_type: String,
    pub order_id: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sent_at: Option<i64>,
}

pub struct NewEmail<'a> {
    pub to_email: &'a str,
    pub subject: &'a str,
    pub html_body: &'a str,
    pub text_body: Option<&'a str>,
    pub priority: i64,
    pub email_type: &'a str,
    pub order_id: Option<i64>,
    pub max_retries: i64,
    pub now: i64,
}

/// Enqueue with dedup on (email_type, order_id, to_email). Returns false when
/// a matching notification is already queued or delivered.
pub async fn enqueue(pool: &SqlitePool, email: &NewEmail<'_>) -> ServiceResult<bool> {
    let res = sqlx::query(
        "INSERT INTO email_queue (to_email, subject, html_body, text_body, status, priority,
                attempts, max_retries, email_type, order_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?, ?)
         ON CONFLICT (email_type, order_id, to_email) DO NOTHING",
    )
    .bind(email.to_email)
    .bind(email.subject)
    .bind(email.html_body)
    .bind(email.text_body)
    .bind(email.priority)
    .bind(email.max_retries)
    .bind(email.email_type)
    .bind(email.order_id)
    .bind(email.now)
    .bind(email.now)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Batch of deliverable emails: pending, due, attempts left. High priority
/// first, then oldest first.
pub async fn due_batch(pool: &SqlitePool, now: i64, limit: i64) -> ServiceResult<Vec<QueuedEmail>> {
    let rows = sqlx::query_as::<_, QueuedEmail>(
        "SELECT * FROM email_queue
         WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
           AND attempts < max_retries
         ORDER BY priority ASC, created_at ASC
         LIMIT ?",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Claim an email for delivery. Returns 0 rows when another sweep got there first.
pub async fn claim_sending(pool: &SqlitePool, id: i64, now: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE email_queue SET status = 'sending', updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn mark_sent(pool: &SqlitePool, id: i64, now: i64) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE email_queue SET status = 'sent', attempts = attempts + 1,
                sent_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Failed attempt with retries left: back to pending, scheduled for later.
pub async fn mark_retry(
    pool: &SqlitePool,
    id: i64,
    next_retry_at: i64,
    error: &str,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE email_queue SET status = 'pending', attempts = attempts + 1,
                next_retry_at = ?, last_error = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(next_retry_at)
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str, now: i64) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE email_queue SET status = 'failed', attempts = attempts + 1,
                last_error = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Put rows stuck in `sending` back to `pending`. A crash between claim and
/// outcome strands the row; reclaiming it once stale keeps delivery
/// at-least-once.
pub async fn reclaim_stale_sending(
    pool: &SqlitePool,
    cutoff: i64,
    now: i64,
) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE email_queue SET status = 'pending', updated_at = ?
         WHERE status = 'sending' AND updated_at < ?",
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> ServiceResult<Option<QueuedEmail>> {
    let row = sqlx::query_as::<_, QueuedEmail>("SELECT * FROM email_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Per status counts for the admin queue stats surface.
pub async fn stats(pool: &SqlitePool) -> ServiceResult<Vec<(String, i64)>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM email_queue GROUP BY status",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Remove delivered/abandoned rows past retention.
pub async fn prune_terminal_before(pool: &SqlitePool, cutoff: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "DELETE FROM email_queue WHERE status IN ('sent', 'failed') AND updated_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
