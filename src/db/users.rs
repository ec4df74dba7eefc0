//! Read-only user lookups

use sqlx::SqlitePool;

use crate::error::ServiceResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: Option<String>,
    pub created_at: i64,
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> ServiceResult<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}
