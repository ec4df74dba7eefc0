//! Read-only product catalog lookups

use sqlx::SqlitePool;

use crate::error::ServiceResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub is_active: i64,
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> ServiceResult<Option<Product>> {
    let product =
        sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = ? AND is_active = 1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(product)
}
