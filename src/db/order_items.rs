//! Order items table queries
//!
//! Item status walks the provisioning checkpoints:
//! `pending` → `processing` (provider order created) → `pending_key`
//! (paid, key not ready) → `complete` (key delivered). Terminal failures
//! land in `failed` (exhausted/invalid) or `key_error` (unknown provider code).

use sqlx::SqlitePool;

use crate::error::ServiceResult;

pub mod status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const PENDING_KEY: &str = "pending_key";
    pub const COMPLETE: &str = "complete";
    pub const FAILED: &str = "failed";
    pub const KEY_ERROR: &str = "key_error";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: String,
    pub price: f64,
    pub quantity: i64,
    pub provider_order_id: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub delivered_key: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrderItem {
    /// True when the item still needs provisioning work.
    pub fn needs_provisioning(&self) -> bool {
        self.delivered_key.is_none()
            && matches!(
                self.status.as_str(),
                status::PENDING | status::PROCESSING | status::PENDING_KEY
            )
    }
}

pub async fn insert(
    pool: &SqlitePool,
    order_id: i64,
    product_id: &str,
    price: f64,
    quantity: i64,
    now: i64,
) -> ServiceResult<i64> {
    let res = sqlx::query(
        "INSERT INTO order_items (order_id, product_id, price, quantity, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'pending', ?, ?)",
    )
    .bind(order_id)
    .bind(product_id)
    .bind(price)
    .bind(quantity)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> ServiceResult<Option<OrderItem>> {
    let item = sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(item)
}

pub async fn list_for_order(pool: &SqlitePool, order_id: i64) -> ServiceResult<Vec<OrderItem>> {
    let items = sqlx::query_as::<_, OrderItem>(
        "SELECT * FROM order_items WHERE order_id = ? ORDER BY id",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

/// Checkpoint 1: provider order created.
pub async fn set_provider_order(
    pool: &SqlitePool,
    item_id: i64,
    provider_order_id: &str,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE order_items SET provider_order_id = ?, status = 'processing', updated_at = ?
         WHERE id = ?",
    )
    .bind(provider_order_id)
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Checkpoint 2: provider order paid.
pub async fn set_transaction(
    pool: &SqlitePool,
    item_id: i64,
    transaction_id: &str,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE order_items SET provider_transaction_id = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(transaction_id)
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_status(
    pool: &SqlitePool,
    item_id: i64,
    new_status: &str,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query("UPDATE order_items SET status = ?, updated_at = ? WHERE id = ?")
        .bind(new_status)
        .bind(now)
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Checkpoint 3: key delivered. Single statement keeps the invariant that a
/// stored key always comes with status `complete`.
pub async fn deliver_key(
    pool: &SqlitePool,
    item_id: i64,
    key: &str,
    now: i64,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE order_items SET delivered_key = ?, status = 'complete', updated_at = ?
         WHERE id = ?",
    )
    .bind(key)
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Items in a terminal failure state, for the admin re-drive surface.
pub async fn list_failed(pool: &SqlitePool, limit: i64) -> ServiceResult<Vec<OrderItem>> {
    let items = sqlx::query_as::<_, OrderItem>(
        "SELECT * FROM order_items WHERE status IN ('failed', 'key_error')
         ORDER BY updated_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(items)
}
