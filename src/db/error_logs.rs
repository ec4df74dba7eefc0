//! Deduplicated error / quarantine log
//!
//! Repeated occurrences of the same failure collapse into one row keyed by a
//! content hash; `duplicate_count` and `last_occurrence` track the repeats.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::error::ServiceResult;

pub mod severity {
    pub const WARNING: &str = "warning";
    pub const ERROR: &str = "error";
    pub const CRITICAL: &str = "critical";
}

pub mod recovery {
    pub const PENDING: &str = "pending";
    pub const RECOVERED: &str = "recovered";
    pub const QUARANTINED: &str = "quarantined";
    pub const IGNORED: &str = "ignored";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ErrorLog {
    pub id: i64,
    pub error_type: String,
    pub error_code: Option<String>,
    pub severity: String,
    pub source_system: Option<String>,
    pub error_message: String,
    pub context: Option<String>,
    pub duplicate_hash: String,
    pub duplicate_count: i64,
    pub first_occurrence: i64,
    pub last_occurrence: i64,
    pub recovery_status: String,
    pub recovery_notes: Option<String>,
    pub is_quarantined: i64,
    pub requires_manual_review: i64,
    pub is_resolved: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct ErrorEvent<'a> {
    pub error_type: &'a str,
    pub error_code: Option<&'a str>,
    pub severity: &'a str,
    pub source_system: Option<&'a str>,
    pub message: &'a str,
    pub context: Option<&'a serde_json::Value>,
    pub requires_manual_review: bool,
}

/// Identity hash for dedup: type, message, source and code, pipe-joined.
pub fn duplicate_hash(event: &ErrorEvent<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(event.message.as_bytes());
    hasher.update(b"|");
    hasher.update(event.source_system.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(event.error_code.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

/// Record an error. An unresolved row with the same hash absorbs the event;
/// otherwise a new row is inserted. Critical events are quarantined on entry.
pub async fn log_error(pool: &SqlitePool, event: &ErrorEvent<'_>, now: i64) -> ServiceResult<i64> {
    let hash = duplicate_hash(event);

    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM error_logs WHERE duplicate_hash = ? AND is_resolved = 0 LIMIT 1",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await?;

    if let Some((id,)) = existing {
        sqlx::query(
            "UPDATE error_logs SET duplicate_count = duplicate_count + 1,
                    last_occurrence = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        return Ok(id);
    }

    let quarantined = event.severity == severity::CRITICAL;
    let res = sqlx::query(
        "INSERT INTO error_logs (error_type, error_code, severity, source_system, error_message,
                context, duplicate_hash, duplicate_count, first_occurrence, last_occurrence,
                recovery_status, is_quarantined, requires_manual_review, is_resolved,
                created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, 'pending', ?, ?, 0, ?, ?)",
    )
    .bind(event.error_type)
    .bind(event.error_code)
    .bind(event.severity)
    .bind(event.source_system)
    .bind(event.message)
    .bind(event.context.map(|c| c.to_string()))
    .bind(&hash)
    .bind(now)
    .bind(now)
    .bind(quarantined)
    .bind(event.requires_manual_review)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> ServiceResult<Option<ErrorLog>> {
    let row = sqlx::query_as::<_, ErrorLog>("SELECT * FROM error_logs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_unresolved(pool: &SqlitePool, limit: i64) -> ServiceResult<Vec<ErrorLog>> {
    let rows = sqlx::query_as::<_, ErrorLog>(
        "SELECT * FROM error_logs WHERE is_resolved = 0
         ORDER BY last_occurrence DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Recovery transition out of `pending`. `recovered` and `ignored` also
/// resolve the row; `quarantined` keeps it open for manual review.
pub async fn set_recovery(
    pool: &SqlitePool,
    id: i64,
    new_status: &str,
    notes: Option<&str>,
    now: i64,
) -> ServiceResult<u64> {
    let resolved = matches!(new_status, recovery::RECOVERED | recovery::IGNORED);
    let res = sqlx::query(
        "UPDATE error_logs SET recovery_status = ?, recovery_notes = ?,
                is_resolved = ?,
                is_quarantined = CASE WHEN ? = 'quarantined' THEN 1 ELSE is_quarantined END,
                updated_at = ?
         WHERE id = ? AND recovery_status = 'pending'",
    )
    .bind(new_status)
    .bind(notes)
    .bind(resolved)
    .bind(new_status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    fn event<'a>(message: &'a str, severity_: &'a str) -> ErrorEvent<'a> {
        ErrorEvent {
            error_type: "provider_error",
            error_code: Some("ORD03"),
            severity: severity_,
            source_system: Some("provider"),
            message,
            context: None,
            requires_manual_review: false,
        }
    }

    #[tokio::test]
    async fn duplicates_collapse_into_one_row() {
        let pool = testing::pool().await;
        let mut last_id = 0;
        for i in 0..5 {
            last_id = log_error(&pool, &event("key not ready", severity::ERROR), 1000 + i)
                .await
                .unwrap();
        }
        let row = find_by_id(&pool, last_id).await.unwrap().unwrap();
        assert_eq!(row.duplicate_count, 5);
        assert_eq!(row.first_occurrence, 1000);
        assert_eq!(row.last_occurrence, 1004);

        let all = list_unresolved(&pool, 10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn different_messages_get_distinct_rows() {
        let pool = testing::pool().await;
        log_error(&pool, &event("key not ready", severity::ERROR), 1000)
            .await
            .unwrap();
        log_error(&pool, &event("payment refused", severity::ERROR), 1000)
            .await
            .unwrap();
        let all = list_unresolved(&pool, 10).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn critical_errors_are_quarantined_on_entry() {
        let pool = testing::pool().await;
        let id = log_error(&pool, &event("unknown code XX99", severity::CRITICAL), 1000)
            .await
            .unwrap();
        let row = find_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.is_quarantined, 1);
        assert_eq!(row.severity, severity::CRITICAL);
    }

    #[tokio::test]
    async fn recovery_transitions_only_from_pending() {
        let pool = testing::pool().await;
        let id = log_error(&pool, &event("key not ready", severity::ERROR), 1000)
            .await
            .unwrap();

        let n = set_recovery(&pool, id, recovery::RECOVERED, Some("re-driven"), 2000)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let row = find_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.recovery_status, recovery::RECOVERED);
        assert_eq!(row.is_resolved, 1);

        // Second transition is refused.
        let n = set_recovery(&pool, id, recovery::IGNORED, None, 3000)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn resolved_rows_do_not_absorb_new_occurrences() {
        let pool = testing::pool().await;
        let id = log_error(&pool, &event("key not ready", severity::ERROR), 1000)
            .await
            .unwrap();
        set_recovery(&pool, id, recovery::RECOVERED, None, 2000)
            .await
            .unwrap();

        let new_id = log_error(&pool, &event("key not ready", severity::ERROR), 3000)
            .await
            .unwrap();
        assert_ne!(new_id, id);
        let row = find_by_id(&pool, new_id).await.unwrap().unwrap();
        assert_eq!(row.duplicate_count, 1);
    }
}
