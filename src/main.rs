//! keyharbor — digital-goods order fulfillment backend
//!
//! Long-running service that:
//! - Confirms payments via processor webhooks (signature-verified)
//! - Provisions license keys through an external provider with persisted
//!   checkpoints and bounded, ledgered retries
//! - Delivers buyer emails through a durable, deduplicated outbox
//! - Expires stale pending orders and prunes aged operational data

mod api;
mod config;
mod db;
mod email;
mod error;
mod fulfillment;
mod notify;
mod provider;
mod retry;
mod state;
mod stripe;
mod sweeper;

use config::Config;
use state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyharbor=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    tracing::info!("Starting keyharbor (env: {})", config.environment);

    // Initialize application state
    let state = AppState::new(&config).await?;

    spawn_sweeps(&config, &state);

    let app = api::create_router(state);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("keyharbor HTTP listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic background tasks: email delivery, pending-order expiry,
/// retention pruning.
fn spawn_sweeps(config: &Config, state: &AppState) {
    let email_state = state.clone();
    let email_interval = std::time::Duration::from_secs(config.email_sweep_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(email_interval);
        loop {
            interval.tick().await;
            if let Err(e) = notify::sweep(
                &email_state.pool,
                &email_state.mailer,
                &email_state.email_backoff,
                50,
                db::now_ms(),
            )
            .await
            {
                tracing::error!(%e, "Email sweep failed");
            }
        }
    });

    let expiry_pool = state.pool.clone();
    let expiry_interval = std::time::Duration::from_secs(config.expiry_sweep_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(expiry_interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper::expire_pending_orders(&expiry_pool, db::now_ms()).await {
                tracing::error!(%e, "Expiry sweep failed");
            }
        }
    });

    let prune_pool = state.pool.clone();
    let prune_interval = std::time::Duration::from_secs(config.prune_sweep_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper::prune_retention(&prune_pool, db::now_ms()).await {
                tracing::error!(%e, "Retention prune failed");
            }
        }
    });
}
