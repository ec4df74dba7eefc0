//! Operational endpoints: retry ledger stats, failed-item re-drive, error
//! log recovery, outbox stats

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::db::error_logs::{self, recovery};
use crate::db::{email_queue, now_ms, order_items, orders, retry_logs};
use crate::error::{ServiceError, ServiceResult};
use crate::fulfillment;
use crate::state::AppState;

/// GET /api/admin/retry/stats
pub async fn retry_stats(
    State(state): State<AppState>,
) -> ServiceResult<Json<serde_json::Value>> {
    let rows = retry_logs::stats(&state.pool).await?;
    let stats: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(retry_type, status, count)| {
            serde_json::json!({ "retry_type": retry_type, "status": status, "count": count })
        })
        .collect();
    Ok(Json(serde_json::json!({ "stats": stats })))
}

/// GET /api/admin/retry/failed-items
pub async fn failed_items(
    State(state): State<AppState>,
) -> ServiceResult<Json<serde_json::Value>> {
    let items = order_items::list_failed(&state.pool, 100).await?;
    let items: Vec<serde_json::Value> = items
        .into_iter()
        .map(|i| {
            serde_json::json!({
                "id": i.id,
                "order_id": i.order_id,
                "product_id": i.product_id,
                "status": i.status,
                "provider_order_id": i.provider_order_id,
                "updated_at": i.updated_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "items": items })))
}

/// POST /api/admin/retry/items/{id} — re-drive a terminally failed item
///
/// Resets the item to its last good checkpoint and runs the orchestrator for
/// the whole order; checkpoints already reached are not repeated.
pub async fn retry_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> ServiceResult<Json<serde_json::Value>> {
    let Some(item) = order_items::find_by_id(&state.pool, item_id).await? else {
        return Err(ServiceError::not_found(format!("order item {item_id}")));
    };
    if !matches!(
        item.status.as_str(),
        order_items::status::FAILED | order_items::status::KEY_ERROR
    ) {
        return Err(ServiceError::conflict(format!(
            "item is {}, only failed items can be re-driven",
            item.status
        )));
    }

    let resumed_status = if item.provider_transaction_id.is_some() {
        order_items::status::PENDING_KEY
    } else if item.provider_order_id.is_some() {
        order_items::status::PROCESSING
    } else {
        order_items::status::PENDING
    };
    order_items::set_status(&state.pool, item_id, resumed_status, now_ms()).await?;
    tracing::info!(
        order_item_id = item_id,
        resumed_status = resumed_status,
        "Admin re-drive"
    );

    fulfillment::process_order(
        &state.pool,
        &state.provider,
        &state.provider_backoff,
        item.order_id,
        now_ms(),
    )
    .await?;

    let Some(item) = order_items::find_by_id(&state.pool, item_id).await? else {
        return Err(ServiceError::not_found(format!("order item {item_id}")));
    };
    let order = orders::find_by_id(&state.pool, item.order_id).await?;
    Ok(Json(serde_json::json!({
        "item_id": item.id,
        "item_status": item.status,
        "order_status": order.map(|o| o.status),
    })))
}

/// GET /api/admin/errors
pub async fn list_errors(
    State(state): State<AppState>,
) -> ServiceResult<Json<serde_json::Value>> {
    let rows = error_logs::list_unresolved(&state.pool, 100).await?;
    let errors: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "error_type": e.error_type,
                "error_code": e.error_code,
                "severity": e.severity,
                "message": e.error_message,
                "duplicate_count": e.duplicate_count,
                "last_occurrence": e.last_occurrence,
                "is_quarantined": e.is_quarantined != 0,
                "requires_manual_review": e.requires_manual_review != 0,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "errors": errors })))
}

#[derive(Deserialize)]
pub struct RecoveryRequest {
    pub status: String,
    pub notes: Option<String>,
}

/// PUT /api/admin/errors/{id}/recovery
pub async fn set_recovery(
    State(state): State<AppState>,
    Path(error_id): Path<i64>,
    Json(req): Json<RecoveryRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if !matches!(
        req.status.as_str(),
        recovery::RECOVERED | recovery::QUARANTINED | recovery::IGNORED
    ) {
        return Err(ServiceError::bad_request(format!(
            "unknown recovery status {}",
            req.status
        )));
    }
    if error_logs::find_by_id(&state.pool, error_id).await?.is_none() {
        return Err(ServiceError::not_found(format!("error log {error_id}")));
    }

    if error_logs::set_recovery(
        &state.pool,
        error_id,
        &req.status,
        req.notes.as_deref(),
        now_ms(),
    )
    .await?
        == 0
    {
        return Err(ServiceError::conflict("error is no longer pending"));
    }
    Ok(Json(serde_json::json!({ "id": error_id, "recovery_status": req.status })))
}

/// GET /api/admin/emails/stats
pub async fn email_stats(
    State(state): State<AppState>,
) -> ServiceResult<Json<serde_json::Value>> {
    let rows = email_queue::stats(&state.pool).await?;
    let stats: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(status, count)| serde_json::json!({ "status": status, "count": count }))
        .collect();
    Ok(Json(serde_json::json!({ "stats": stats })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::fulfillment::tests::{MockProvider, seed_paid_order};
    use crate::provider::KeyProvider;
    use crate::retry::BackoffPolicy;
    use std::sync::Arc;

    #[tokio::test]
    async fn redrive_resumes_from_last_checkpoint() {
        let pool = testing::pool().await;
        let provider = MockProvider::new();
        let (_, order_id, item_ids) = seed_paid_order(&pool, &["game-a"], 1000).await;

        // First run: create and pay succeed, key retrieval exhausts.
        provider.script("P1", vec![]);
        let dyn_provider: Arc<dyn KeyProvider> = provider.clone();
        fulfillment::process_order(
            &pool,
            &dyn_provider,
            &BackoffPolicy::immediate(2),
            order_id,
            2000,
        )
        .await
        .unwrap();
        let item = order_items::find_by_id(&pool, item_ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, order_items::status::FAILED);
        let (creates, pays, _) = provider.calls();

        // Re-drive with the key now available.
        provider.script("P1", vec![crate::provider::KeyFetch::Delivered("KEY-A".into())]);
        let state = AppState {
            pool: pool.clone(),
            provider: dyn_provider.clone(),
            mailer: Arc::new(crate::email::tests_support::NullMailer),
            stripe_secret_key: "sk_test".into(),
            stripe_webhook_secret: "whsec_test".into(),
            allow_unsigned_webhooks: false,
            provider_backoff: BackoffPolicy::immediate(2),
            email_backoff: BackoffPolicy::immediate(3),
        };
        let resp = retry_item(State(state), Path(item_ids[0])).await.unwrap();
        assert_eq!(resp.0["item_status"], "complete");
        assert_eq!(resp.0["order_status"], "complete");

        // Checkpoints were not repeated.
        let (creates_after, pays_after, _) = provider.calls();
        assert_eq!(creates_after, creates);
        assert_eq!(pays_after, pays);
    }

    #[tokio::test]
    async fn redrive_refuses_healthy_items() {
        let pool = testing::pool().await;
        let provider = MockProvider::new();
        let (_, _, item_ids) = seed_paid_order(&pool, &["game-a"], 1000).await;

        let dyn_provider: Arc<dyn KeyProvider> = provider.clone();
        let state = AppState {
            pool: pool.clone(),
            provider: dyn_provider,
            mailer: Arc::new(crate::email::tests_support::NullMailer),
            stripe_secret_key: "sk_test".into(),
            stripe_webhook_secret: "whsec_test".into(),
            allow_unsigned_webhooks: false,
            provider_backoff: BackoffPolicy::immediate(2),
            email_backoff: BackoffPolicy::immediate(3),
        };
        let err = retry_item(State(state), Path(item_ids[0])).await;
        assert!(matches!(err, Err(ServiceError::App(s, _)) if s == axum::http::StatusCode::CONFLICT));
    }
}
