//! Stripe webhook handler
//!
//! POST /stripe/webhook — handles payment events (raw body for signature
//! verification). Replays are harmless: the paid transition is a guarded
//! update, fulfillment re-reads persisted checkpoints, and the notification
//! enqueue is deduped.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::db::error_logs::{self, ErrorEvent, severity};
use crate::db::now_ms;
use crate::db::orders::{self, Order};
use crate::db::users;
use crate::error::ServiceResult;
use crate::state::AppState;
use crate::{fulfillment, notify, stripe};

/// Handle incoming Stripe webhook events
///
/// Must receive raw body (not JSON) for HMAC signature verification.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // 1. Verify signature (or honor the non-production escape hatch)
    match headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    {
        Some(sig_header) => {
            if let Err(e) =
                stripe::verify_webhook_signature(&body, sig_header, &state.stripe_webhook_secret)
            {
                tracing::warn!(error = e, "Webhook signature verification failed");
                return StatusCode::BAD_REQUEST;
            }
        }
        None => {
            if !state.allow_unsigned_webhooks {
                tracing::warn!("Missing Stripe-Signature header");
                return StatusCode::BAD_REQUEST;
            }
            tracing::warn!("Accepting unsigned webhook (ALLOW_UNSIGNED_WEBHOOKS)");
        }
    }

    // 2. Parse JSON event
    let event: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%e, "Failed to parse webhook JSON");
            return StatusCode::BAD_REQUEST;
        }
    };

    let event_type = event["type"].as_str().unwrap_or("");
    tracing::info!(event_type = event_type, "Received Stripe webhook");

    // 3. Handle event types
    match event_type {
        "payment_intent.succeeded" => handle_payment_succeeded(&state, &event).await,
        "payment_intent.payment_failed" => handle_payment_failed(&state, &event).await,
        _ => {
            tracing::debug!(event_type = event_type, "Unhandled webhook event type");
            StatusCode::OK
        }
    }
}

/// Resolve the order an intent event belongs to. Falls back to the order_id
/// the intent carries in metadata and retroactively links orphaned intents,
/// but only onto an order that has no intent stored yet.
async fn resolve_order(
    state: &AppState,
    obj: &serde_json::Value,
    intent_id: &str,
) -> ServiceResult<Option<Order>> {
    if let Some(order) = orders::find_by_intent(&state.pool, intent_id).await? {
        return Ok(Some(order));
    }

    let Some(order_id) = obj
        .get("metadata")
        .and_then(|m| m["order_id"].as_str())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return Ok(None);
    };

    let Some(order) = orders::find_by_id(&state.pool, order_id).await? else {
        return Ok(None);
    };

    if order.payment_intent_id.is_some() {
        // Metadata points at an order already tied to a different intent.
        return Ok(None);
    }

    if orders::link_payment_intent(&state.pool, order.id, intent_id, now_ms()).await? > 0 {
        tracing::info!(
            order_id = order.id,
            intent_id = intent_id,
            "Linked orphaned payment intent via metadata"
        );
        orders::find_by_id(&state.pool, order.id).await
    } else {
        Ok(None)
    }
}

/// payment_intent.succeeded → mark paid, provision, notify
async fn handle_payment_succeeded(state: &AppState, event: &serde_json::Value) -> StatusCode {
    let obj = match event.get("data").and_then(|d| d.get("object")) {
        Some(o) => o,
        None => return StatusCode::OK,
    };
    let intent_id = match obj["id"].as_str() {
        Some(s) => s,
        None => {
            tracing::warn!("payment_intent.succeeded missing intent id");
            return StatusCode::BAD_REQUEST;
        }
    };

    let order = match resolve_order(state, obj, intent_id).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            tracing::warn!(intent_id = intent_id, "Webhook for unresolvable intent, dropping");
            let _ = error_logs::log_error(
                &state.pool,
                &ErrorEvent {
                    error_type: "webhook_orphan",
                    error_code: None,
                    severity: severity::WARNING,
                    source_system: Some("stripe"),
                    message: "payment_intent.succeeded with no matching order",
                    context: Some(&serde_json::json!({ "intent_id": intent_id })),
                    requires_manual_review: true,
                },
                now_ms(),
            )
            .await;
            return StatusCode::OK;
        }
        Err(e) => {
            tracing::error!(%e, "DB error resolving webhook order");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    match orders::mark_paid(&state.pool, order.id, now_ms()).await {
        Ok(0) => {
            tracing::info!(order_id = order.id, "Order already paid (webhook replay)");
        }
        Ok(_) => {
            tracing::info!(order_id = order.id, intent_id = intent_id, "Order marked paid");
        }
        Err(e) => {
            tracing::error!(%e, "Failed to mark order paid");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    if let Err(e) = fulfillment::process_order(
        &state.pool,
        &state.provider,
        &state.provider_backoff,
        order.id,
        now_ms(),
    )
    .await
    {
        tracing::error!(%e, order_id = order.id, "Fulfillment failed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    StatusCode::OK
}

/// payment_intent.payment_failed → record failure, notify the buyer
async fn handle_payment_failed(state: &AppState, event: &serde_json::Value) -> StatusCode {
    let obj = match event.get("data").and_then(|d| d.get("object")) {
        Some(o) => o,
        None => return StatusCode::OK,
    };
    let intent_id = match obj["id"].as_str() {
        Some(s) => s,
        None => return StatusCode::OK,
    };

    let order = match resolve_order(state, obj, intent_id).await {
        Ok(Some(order)) => order,
        Ok(None) => {
            tracing::warn!(intent_id = intent_id, "Payment failure for unknown intent");
            return StatusCode::OK;
        }
        Err(e) => {
            tracing::error!(%e, "DB error resolving failed payment");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    if let Err(e) = orders::mark_payment_failed(&state.pool, order.id, now_ms()).await {
        tracing::error!(%e, "Failed to record payment failure");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    tracing::info!(order_id = order.id, "Payment failed");

    if let Ok(Some(user)) = users::find_by_id(&state.pool, order.user_id).await {
        let _ = notify::enqueue_payment_failed(&state.pool, order.id, &user.email, now_ms()).await;
    }

    StatusCode::OK
}
