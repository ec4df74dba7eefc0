//! API routes for keyharbor

pub mod admin;
pub mod health;
pub mod orders;
pub mod stripe_webhook;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the combined router
pub fn create_router(state: AppState) -> Router {
    // Buyer-facing order surface (caller identity passed explicitly; auth is
    // terminated upstream)
    let orders = Router::new()
        .route("/api/payments/intent", post(orders::create_payment_intent))
        .route("/api/orders", post(orders::create_order))
        .route(
            "/api/orders/{id}/license-keys",
            get(orders::license_keys),
        )
        .route("/api/orders/{id}/cancel", post(orders::cancel_order))
        .route("/api/orders/{id}/status", put(orders::set_status));

    // Operational surface
    let admin = Router::new()
        .route("/api/admin/retry/stats", get(admin::retry_stats))
        .route("/api/admin/retry/failed-items", get(admin::failed_items))
        .route("/api/admin/retry/items/{id}", post(admin::retry_item))
        .route("/api/admin/errors", get(admin::list_errors))
        .route("/api/admin/errors/{id}/recovery", put(admin::set_recovery))
        .route("/api/admin/emails/stats", get(admin::email_stats));

    // Stripe webhook (signature-verified, raw body)
    let webhook = Router::new().route("/stripe/webhook", post(stripe_webhook::handle_webhook));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(orders)
        .merge(admin)
        .merge(webhook)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
