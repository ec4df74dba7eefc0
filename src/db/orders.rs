//! Orders table queries

use sqlx::SqlitePool;

use crate::error::ServiceResult;

/// Order lifecycle states stored in `orders.status`
pub mod status {
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const COMPLETE: &str = "complete";
    pub const CANCELLED: &str = "cancelled";
    pub const EXPIRED: &str = "expired";
}

/// Payment states stored in `orders.payment_status`
pub mod payment {
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub total_price: f64,
    pub currency: String,
    pub status: String,
    pub payment_status: String,
    pub payment_intent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub async fn create(
    pool: &SqlitePool,
    user_id: i64,
    total_price: f64,
    currency: &str,
    now: i64,
) -> ServiceResult<i64> {
    let res = sqlx::query(
        "INSERT INTO orders (user_id, total_price, currency, status, payment_status, created_at, updated_at)
         VALUES (?, ?, ?, 'pending', 'pending', ?, ?)",
    )
    .bind(user_id)
    .bind(total_price)
    .bind(currency)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> ServiceResult<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(order)
}

pub async fn find_by_intent(pool: &SqlitePool, intent_id: &str) -> ServiceResult<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE payment_intent_id = ?")
        .bind(intent_id)
        .fetch_optional(pool)
        .await?;
    Ok(order)
}

/// Duplicate-submission guard: a pending order for the same user with the
/// same total created after `window_start` already exists.
pub async fn has_recent_pending_duplicate(
    pool: &SqlitePool,
    user_id: i64,
    total_price: f64,
    window_start: i64,
) -> ServiceResult<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM orders
         WHERE user_id = ? AND total_price = ? AND status = 'pending' AND created_at >= ?
         LIMIT 1",
    )
    .bind(user_id)
    .bind(total_price)
    .bind(window_start)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Attach a payment intent. Guarded: links only when no intent is stored yet,
/// so a replayed or mismatched event can never overwrite an existing link.
pub async fn link_payment_intent(
    pool: &SqlitePool,
    order_id: i64,
    intent_id: &str,
    now: i64,
) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET payment_intent_id = ?, updated_at = ?
         WHERE id = ? AND payment_intent_id IS NULL",
    )
    .bind(intent_id)
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Idempotent paid transition. Returns 0 rows affected on replay.
pub async fn mark_paid(pool: &SqlitePool, order_id: i64, now: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET payment_status = 'paid',
                status = CASE WHEN status = 'pending' THEN 'paid' ELSE status END,
                updated_at = ?
         WHERE id = ? AND payment_status <> 'paid'",
    )
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn mark_payment_failed(pool: &SqlitePool, order_id: i64, now: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET payment_status = 'failed', updated_at = ?
         WHERE id = ? AND payment_status = 'pending'",
    )
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Cancel is allowed only from `pending`; the predicate makes concurrent
/// cancel/pay races resolve to whichever statement lands first.
pub async fn cancel(pool: &SqlitePool, order_id: i64, now: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET status = 'cancelled', updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Explicit status change. A `complete` order never goes back to `pending`.
pub async fn set_status(
    pool: &SqlitePool,
    order_id: i64,
    new_status: &str,
    now: i64,
) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET status = ?, updated_at = ?
         WHERE id = ? AND NOT (status = 'complete' AND ? = 'pending')",
    )
    .bind(new_status)
    .bind(now)
    .bind(order_id)
    .bind(new_status)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Fulfillment-driven status sync: only moves between `paid` and `complete`,
/// in either direction (an item regressing pulls the order back to `paid`).
pub async fn sync_fulfillment_status(
    pool: &SqlitePool,
    order_id: i64,
    desired: &str,
    now: i64,
) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET status = ?, updated_at = ?
         WHERE id = ? AND status IN ('paid', 'complete') AND status <> ?",
    )
    .bind(desired)
    .bind(now)
    .bind(order_id)
    .bind(desired)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Expire stale pending orders in one guarded statement.
pub async fn expire_stale(pool: &SqlitePool, cutoff: i64, now: i64) -> ServiceResult<u64> {
    let res = sqlx::query(
        "UPDATE orders SET status = 'expired', updated_at = ?
         WHERE status = 'pending' AND created_at < ?",
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
