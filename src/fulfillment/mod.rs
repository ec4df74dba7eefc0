//! Fulfillment orchestrator
//!
//! Drives every item of a paid order through the provider checkpoints
//! create → pay → fetch-key. Each checkpoint is persisted the moment it is
//! reached, and every stage re-reads the stored item state before calling
//! out, so a crashed or replayed run resumes where the last one stopped and
//! never repeats a provider side effect.


use std::sync::Arc;

use sqlx::SqlitePool;

use crate::db::error_logs::{self, ErrorEvent, severity};
use crate::db::order_items::{self, OrderItem, status as item_status};
use crate::db::orders::{self, Order, payment, status as order_status};
use crate::db::retry_logs::retry_type;
use crate::db::users;
use crate::error::{ServiceError, ServiceResult};
use crate::notify;
use crate::provider::{self, KEY_ALREADY_DELIVERED, KeyFetch, KeyProvider, ProviderError};
use crate::retry::{AttemptContext, BackoffPolicy, Outcome, RetryOutcome, run_retries};

/// Pure completion rule: an order is complete exactly when every item is.
/// An order with a non-complete item regresses to `paid`.
pub fn order_status_from_items(items: &[OrderItem]) -> &'static str {
    if !items.is_empty()
        && items
            .iter()
            .all(|i| i.status == item_status::COMPLETE)
    {
        order_status::COMPLETE
    } else {
        order_status::PAID
    }
}

/// Provision every outstanding item of a paid order, then sync the order
/// status and queue the license-key email if the order just completed.
///
/// Idempotent: a fully delivered order makes no provider calls and writes no
/// new ledger rows.
pub async fn process_order(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order_id: i64,
    now: i64,
) -> ServiceResult<()> {
    let Some(order) = orders::find_by_id(pool, order_id).await? else {
        tracing::warn!(order_id = order_id, "Fulfillment requested for unknown order");
        return Ok(());
    };
    if order.payment_status != payment::PAID {
        tracing::warn!(
            order_id = order_id,
            payment_status = %order.payment_status,
            "Fulfillment requested for unpaid order, skipping"
        );
        return Ok(());
    }

    let items = order_items::list_for_order(pool, order_id).await?;
    for item in items.iter().filter(|i| i.needs_provisioning()) {
        provision_item(pool, provider, policy, &order, item.id, now).await?;
    }

    finalize_order(pool, &order, now).await
}

/// Recompute and persist the order status, queueing the consolidated
/// license-key email when the order is complete. The deduped outbox makes
/// repeated calls harmless.
pub async fn finalize_order(pool: &SqlitePool, order: &Order, now: i64) -> ServiceResult<()> {
    let items = order_items::list_for_order(pool, order.id).await?;
    let desired = order_status_from_items(&items);
    if orders::sync_fulfillment_status(pool, order.id, desired, now).await? > 0 {
        tracing::info!(order_id = order.id, status = desired, "Order status updated");
    }

    if desired == order_status::COMPLETE {
        let Some(user) = users::find_by_id(pool, order.user_id).await? else {
            tracing::warn!(order_id = order.id, "Completed order has no user, email skipped");
            return Ok(());
        };
        let keys: Vec<(String, String)> = items
            .iter()
            .map(|i| {
                (
                    i.product_id.clone(),
                    i.delivered_key.clone().unwrap_or_default(),
                )
            })
            .collect();
        notify::enqueue_license_keys(pool, order.id, &user.email, &keys, now).await?;
    }
    Ok(())
}

/// Run one item through whatever checkpoints it still misses.
async fn provision_item(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order: &Order,
    item_id: i64,
    now: i64,
) -> ServiceResult<()> {
    // Stage 1: provider order.
    let Some(item) = order_items::find_by_id(pool, item_id).await? else {
        return Err(ServiceError::not_found(format!("order item {item_id}")));
    };
    let provider_order_id = match item.provider_order_id.clone() {
        Some(id) => id,
        None => {
            match ensure_provider_order(pool, provider, policy, order, &item, now).await? {
                Some(id) => id,
                None => return Ok(()), // terminal failure recorded
            }
        }
    };

    // Stage 2: payment. Re-read so a checkpoint written above is seen.
    let Some(item) = order_items::find_by_id(pool, item_id).await? else {
        return Err(ServiceError::not_found(format!("order item {item_id}")));
    };
    if item.provider_transaction_id.is_none()
        && ensure_transaction(pool, provider, policy, order, &item, &provider_order_id, now)
            .await?
            .is_none()
    {
        return Ok(());
    }

    // Stage 3: key retrieval.
    let Some(item) = order_items::find_by_id(pool, item_id).await? else {
        return Err(ServiceError::not_found(format!("order item {item_id}")));
    };
    if item.delivered_key.is_none() {
        ensure_key(pool, provider, policy, order, &item, &provider_order_id, true, now).await?;
    }
    Ok(())
}

/// Retry classification for create/pay: the provider gives no permanent
/// failure signal for these, so every error is treated as transient.
fn transient<T>(e: ProviderError) -> Outcome<T> {
    let code = match &e {
        ProviderError::Api { code, .. } => Some(code.clone()),
        _ => None,
    };
    Outcome::Retry {
        code,
        message: e.to_string(),
    }
}

async fn ensure_provider_order(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order: &Order,
    item: &OrderItem,
    now: i64,
) -> ServiceResult<Option<String>> {
    // Probe once; hand over to the ledgered retry loop only on failure.
    let probed = match provider.create_order(&item.product_id).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(order_item_id = item.id, error = %e, "Provider order creation failed, retrying");
            let ctx = AttemptContext {
                retry_type: retry_type::ORDER_CREATION,
                order_id: Some(order.id),
                order_item_id: Some(item.id),
                provider_order_id: None,
                metadata: Some(serde_json::json!({ "product_id": item.product_id })),
            };
            let product_id = item.product_id.clone();
            let outcome = run_retries(pool, &ctx, policy, |_| {
                let provider = provider.clone();
                let product_id = product_id.clone();
                async move {
                    match provider.create_order(&product_id).await {
                        Ok(id) => Outcome::Success(id),
                        Err(e) => transient(e),
                    }
                }
            })
            .await?;
            match outcome {
                RetryOutcome::Done(id) => Some(id),
                RetryOutcome::Exhausted { code, message }
                | RetryOutcome::Fatal { code, message } => {
                    fail_item(
                        pool,
                        order,
                        item,
                        item_status::FAILED,
                        "order_creation",
                        code.as_deref(),
                        &message,
                        severity::ERROR,
                        now,
                    )
                    .await?;
                    None
                }
            }
        }
    };

    if let Some(ref id) = probed {
        order_items::set_provider_order(pool, item.id, id, now).await?;
        tracing::info!(order_item_id = item.id, provider_order_id = %id, "Provider order created");
    }
    Ok(probed)
}

async fn ensure_transaction(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order: &Order,
    item: &OrderItem,
    provider_order_id: &str,
    now: i64,
) -> ServiceResult<Option<String>> {
    let probed = match provider.pay_order(provider_order_id).await {
        Ok(tx) => Some(tx),
        Err(e) => {
            tracing::warn!(order_item_id = item.id, error = %e, "Provider payment failed, retrying");
            let ctx = AttemptContext {
                retry_type: retry_type::PAYMENT,
                order_id: Some(order.id),
                order_item_id: Some(item.id),
                provider_order_id: Some(provider_order_id.to_string()),
                metadata: None,
            };
            let pid = provider_order_id.to_string();
            let outcome = run_retries(pool, &ctx, policy, |_| {
                let provider = provider.clone();
                let pid = pid.clone();
                async move {
                    match provider.pay_order(&pid).await {
                        Ok(tx) => Outcome::Success(tx),
                        Err(e) => transient(e),
                    }
                }
            })
            .await?;
            match outcome {
                RetryOutcome::Done(tx) => Some(tx),
                RetryOutcome::Exhausted { code, message }
                | RetryOutcome::Fatal { code, message } => {
                    fail_item(
                        pool,
                        order,
                        item,
                        item_status::FAILED,
                        "payment",
                        code.as_deref(),
                        &message,
                        severity::ERROR,
                        now,
                    )
                    .await?;
                    None
                }
            }
        }
    };

    if let Some(ref tx) = probed {
        order_items::set_transaction(pool, item.id, tx, now).await?;
        tracing::info!(order_item_id = item.id, transaction_id = %tx, "Provider order paid");
    }
    Ok(probed)
}

/// Key-fetch resolution carried out of the retry loop.
enum Resolved {
    Key(String),
    Already(Option<String>),
}

/// Fetch the key for one item. `fail_when_exhausted` distinguishes the
/// orchestrator (exhaustion is terminal) from the on-demand path (exhaustion
/// leaves the item `pending_key` for the next webhook or poll).
#[allow(clippy::too_many_arguments)]
async fn ensure_key(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order: &Order,
    item: &OrderItem,
    provider_order_id: &str,
    fail_when_exhausted: bool,
    now: i64,
) -> ServiceResult<()> {
    // Probe once, un-ledgered.
    match provider.fetch_key(provider_order_id).await {
        Ok(KeyFetch::Delivered(key)) => {
            return deliver(pool, item, &key, now).await;
        }
        Ok(KeyFetch::AlreadyDelivered(carried)) => {
            return resolve_already_delivered(
                pool,
                provider,
                order,
                item,
                provider_order_id,
                carried,
                now,
            )
            .await;
        }
        Ok(KeyFetch::InvalidOrder) => {
            return fail_item(
                pool,
                order,
                item,
                item_status::FAILED,
                "key_retrieval",
                Some(provider::code::INVALID_ORDER),
                "provider does not recognize the order",
                severity::CRITICAL,
                now,
            )
            .await;
        }
        Ok(KeyFetch::Unknown(code)) => {
            return fail_item(
                pool,
                order,
                item,
                item_status::KEY_ERROR,
                "key_retrieval",
                Some(&code),
                "provider returned an unrecognized error code",
                severity::CRITICAL,
                now,
            )
            .await;
        }
        Ok(KeyFetch::NotReady) => {
            tracing::info!(order_item_id = item.id, "Key not ready yet, scheduling retries");
        }
        Err(e) => {
            tracing::warn!(order_item_id = item.id, error = %e, "Key fetch failed, scheduling retries");
        }
    }

    // Key pending: checkpoint the state, then retry with the ledger.
    order_items::set_status(pool, item.id, item_status::PENDING_KEY, now).await?;

    let ctx = AttemptContext {
        retry_type: retry_type::KEY_RETRIEVAL,
        order_id: Some(order.id),
        order_item_id: Some(item.id),
        provider_order_id: Some(provider_order_id.to_string()),
        metadata: None,
    };
    let pid = provider_order_id.to_string();
    let outcome = run_retries(pool, &ctx, policy, |_| {
        let provider = provider.clone();
        let pid = pid.clone();
        async move {
            match provider.fetch_key(&pid).await {
                Ok(KeyFetch::Delivered(key)) => Outcome::Success(Resolved::Key(key)),
                Ok(KeyFetch::AlreadyDelivered(carried)) => {
                    Outcome::Success(Resolved::Already(carried))
                }
                Ok(KeyFetch::NotReady) => Outcome::Retry {
                    code: Some(provider::code::KEY_NOT_READY.to_string()),
                    message: "key not ready".into(),
                },
                Ok(KeyFetch::InvalidOrder) => Outcome::Fatal {
                    code: Some(provider::code::INVALID_ORDER.to_string()),
                    message: "provider does not recognize the order".into(),
                },
                Ok(KeyFetch::Unknown(code)) => Outcome::Fatal {
                    code: Some(code),
                    message: "provider returned an unrecognized error code".into(),
                },
                Err(e) => Outcome::Retry {
                    code: None,
                    message: e.to_string(),
                },
            }
        }
    })
    .await?;

    match outcome {
        RetryOutcome::Done(Resolved::Key(key)) => deliver(pool, item, &key, now).await,
        RetryOutcome::Done(Resolved::Already(carried)) => {
            resolve_already_delivered(pool, provider, order, item, provider_order_id, carried, now)
                .await
        }
        RetryOutcome::Exhausted { code, message } => {
            if fail_when_exhausted {
                fail_item(
                    pool,
                    order,
                    item,
                    item_status::FAILED,
                    "key_retrieval",
                    code.as_deref(),
                    &message,
                    severity::ERROR,
                    now,
                )
                .await
            } else {
                tracing::info!(
                    order_item_id = item.id,
                    "Key still not ready, leaving item pending"
                );
                Ok(())
            }
        }
        RetryOutcome::Fatal { code, message } => {
            let status = match code.as_deref() {
                Some(provider::code::INVALID_ORDER) => item_status::FAILED,
                _ => item_status::KEY_ERROR,
            };
            fail_item(
                pool,
                order,
                item,
                status,
                "key_retrieval",
                code.as_deref(),
                &message,
                severity::CRITICAL,
                now,
            )
            .await
        }
    }
}

/// The provider claims the key already went out. Re-query once for the real
/// key; if it stays out of reach, store the sentinel and flag the item for
/// review instead of blocking the order.
async fn resolve_already_delivered(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    order: &Order,
    item: &OrderItem,
    provider_order_id: &str,
    carried: Option<String>,
    now: i64,
) -> ServiceResult<()> {
    if let Some(key) = carried {
        tracing::info!(order_item_id = item.id, "Recovered previously delivered key");
        return deliver(pool, item, &key, now).await;
    }

    match provider.fetch_key(provider_order_id).await {
        Ok(KeyFetch::Delivered(key)) | Ok(KeyFetch::AlreadyDelivered(Some(key))) => {
            tracing::info!(order_item_id = item.id, "Recovered previously delivered key on re-query");
            deliver(pool, item, &key, now).await
        }
        other => {
            tracing::warn!(
                order_item_id = item.id,
                "Provider reports prior delivery but will not return the key, storing sentinel"
            );
            if let Err(e) = &other {
                tracing::debug!(error = %e, "Re-query transport error");
            }
            error_logs::log_error(
                pool,
                &ErrorEvent {
                    error_type: "key_already_delivered",
                    error_code: Some(provider::code::ALREADY_DELIVERED),
                    severity: severity::WARNING,
                    source_system: Some("provider"),
                    message: "key reported delivered but unrecoverable",
                    context: Some(&serde_json::json!({
                        "order_id": order.id,
                        "order_item_id": item.id,
                        "provider_order_id": provider_order_id,
                    })),
                    requires_manual_review: true,
                },
                now,
            )
            .await?;
            deliver(pool, item, KEY_ALREADY_DELIVERED, now).await
        }
    }
}

async fn deliver(pool: &SqlitePool, item: &OrderItem, key: &str, now: i64) -> ServiceResult<()> {
    order_items::deliver_key(pool, item.id, key, now).await?;
    tracing::info!(order_item_id = item.id, "License key delivered");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fail_item(
    pool: &SqlitePool,
    order: &Order,
    item: &OrderItem,
    status: &str,
    stage: &str,
    code: Option<&str>,
    message: &str,
    severity_: &str,
    now: i64,
) -> ServiceResult<()> {
    order_items::set_status(pool, item.id, status, now).await?;
    error_logs::log_error(
        pool,
        &ErrorEvent {
            error_type: "provider_provisioning",
            error_code: code,
            severity: severity_,
            source_system: Some("provider"),
            message,
            context: Some(&serde_json::json!({
                "order_id": order.id,
                "order_item_id": item.id,
                "product_id": item.product_id,
                "stage": stage,
            })),
            requires_manual_review: true,
        },
        now,
    )
    .await?;
    tracing::error!(
        order_item_id = item.id,
        stage = stage,
        code = code.unwrap_or(""),
        "Item provisioning failed terminally"
    );
    Ok(())
}

/// Outcome of the on-demand license-keys endpoint.
#[derive(Debug, serde::Serialize)]
pub struct KeysReport {
    pub ready: Vec<ReadyKey>,
    pub pending: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ReadyKey {
    pub product_id: String,
    pub key: String,
}

/// On-demand key retrieval for a buyer polling their order. Gives each
/// undelivered item a short burst of fetch attempts under `policy` and
/// reports what is ready versus still pending. Never errors on provider
/// trouble; an item that stays unready is simply reported pending.
pub async fn retrieve_license_keys(
    pool: &SqlitePool,
    provider: &Arc<dyn KeyProvider>,
    policy: &BackoffPolicy,
    order_id: i64,
    user_id: i64,
    now: i64,
) -> ServiceResult<KeysReport> {
    let Some(order) = orders::find_by_id(pool, order_id).await? else {
        return Err(ServiceError::not_found(format!("order {order_id}")));
    };
    if order.user_id != user_id {
        return Err(ServiceError::not_found(format!("order {order_id}")));
    }

    let mut report = KeysReport {
        ready: Vec::new(),
        pending: Vec::new(),
    };

    for item in order_items::list_for_order(pool, order_id).await? {
        if let Some(key) = item.delivered_key.clone() {
            report.ready.push(ReadyKey {
                product_id: item.product_id,
                key,
            });
            continue;
        }

        // Only items that are paid at the provider can yield a key here.
        let fetchable = order.payment_status == payment::PAID
            && item.provider_order_id.is_some()
            && item.provider_transaction_id.is_some()
            && item.needs_provisioning();
        if !fetchable {
            report.pending.push(item.product_id);
            continue;
        }

        let provider_order_id = item.provider_order_id.clone().unwrap_or_default();
        ensure_key(
            pool,
            provider,
            policy,
            &order,
            &item,
            &provider_order_id,
            false,
            now,
        )
        .await?;

        match order_items::find_by_id(pool, item.id).await? {
            Some(after) if after.delivered_key.is_some() => report.ready.push(ReadyKey {
                product_id: after.product_id,
                key: after.delivered_key.unwrap_or_default(),
            }),
            _ => report.pending.push(item.product_id),
        }
    }

    finalize_order(pool, &order, now).await?;
    Ok(report)
}
