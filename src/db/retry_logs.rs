//! Retry ledger queries
//!
//! Append-only log of external-call attempts. Rows are written before the
//! call they describe and finalized after, so a crash mid-call leaves an
//! `in_progress` row as evidence.

use sqlx::SqlitePool;

use crate::error::ServiceResult;

pub mod retry_type {
    pub const ORDER_CREATION: &str = "order_creation";
    pub const PAYMENT: &str = "payment";
    pub const KEY_RETRIEVAL: &str = "key_retrieval";
    pub const EMAIL_SENDING: &str = "email_sending";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryLog {
    pub id: i64,
    pub order_id: Option<i64>,
    pub order_item_id: Option<i64>,
    pub provider_order_id: Option<String>,
    pub retry_type: String,
    pub attempt_number: i64,
    pub max_attempts: i64,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub metadata: Option<String>,
}

pub struct NewAttempt<'a> {
    pub order_id: Option<i64>,
    pub order_item_id: Option<i64>,
    pub provider_order_id: Option<&'a str>,
    pub retry_type: &'a str,
    pub attempt_number: i64,
    pub max_attempts: i64,
    pub metadata: Option<&'a serde_json::Value>,
    pub now: i64,
}

/// Open an `in_progress` ledger row for an attempt about to run.
pub async fn start_attempt(pool: &SqlitePool, attempt: &NewAttempt<'_>) -> ServiceResult<i64> {
    let res = sqlx::query(
        "INSERT INTO retry_logs (order_id, order_item_id, provider_order_id, retry_type,
                attempt_number, max_attempts, status, started_at, metadata)
         VALUES (?, ?, ?, ?, ?, ?, 'in_progress', ?, ?)",
    )
    .bind(attempt.order_id)
    .bind(attempt.order_item_id)
    .bind(attempt.provider_order_id)
    .bind(attempt.retry_type)
    .bind(attempt.attempt_number)
    .bind(attempt.max_attempts)
    .bind(attempt.now)
    .bind(attempt.metadata.map(|m| m.to_string()))
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

/// Finalize a ledger row once its attempt resolved.
pub async fn finish_attempt(
    pool: &SqlitePool,
    id: i64,
    status: &str,
    error_code: Option<&str>,
    error_message: Option<&str>,
    next_retry_at: Option<i64>,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE retry_logs SET status = ?, error_code = ?, error_message = ?,
                next_retry_at = ?, completed_at = ?
         WHERE id = ?",
    )
    .bind(status)
    .bind(error_code)
    .bind(error_message)
    .bind(next_retry_at)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_item(
    pool: &SqlitePool,
    order_item_id: i64,
    retry_type: &str,
) -> ServiceResult<Vec<RetryLog>> {
    let rows = sqlx::query_as::<_, RetryLog>(
        "SELECT * FROM retry_logs WHERE order_item_id = ? AND retry_type = ? ORDER BY id",
    )
    .bind(order_item_id)
    .bind(retry_type)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per type/status counts for the admin stats surface.
pub async fn stats(pool: &SqlitePool) -> ServiceResult<Vec<(String, String, i64)>> {
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT retry_type, status, COUNT(*) FROM retry_logs GROUP BY retry_type, status",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn prune_started_before(pool: &SqlitePool, cutoff: i64) -> ServiceResult<u64> {
    let res = sqlx::query("DELETE FROM retry_logs WHERE started_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
