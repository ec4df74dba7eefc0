//! Application state for keyharbor

use std::sync::Arc;

use aws_sdk_sesv2::Client as SesClient;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::config::Config;
use crate::email::{MailTransport, SesTransport};
use crate::provider::{HttpKeyProvider, KeyProvider};
use crate::retry::BackoffPolicy;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection pool
    pub pool: SqlitePool,
    /// Key provider the orchestrator provisions through
    pub provider: Arc<dyn KeyProvider>,
    /// Outbound mail transport
    pub mailer: Arc<dyn MailTransport>,
    /// Stripe secret key
    pub stripe_secret_key: String,
    /// Stripe webhook signing secret
    pub stripe_webhook_secret: String,
    /// Accept unsigned webhooks (non-production only)
    pub allow_unsigned_webhooks: bool,
    /// Backoff for provider create/pay/fetch retries
    pub provider_backoff: BackoffPolicy,
    /// Backoff for email delivery retries
    pub email_backoff: BackoffPolicy,
}

impl AppState {
    /// Create a new AppState
    pub async fn new(config: &Config) -> Result<Self, BoxError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let ses = if let Ok(ses_region) = std::env::var("SES_REGION") {
            let ses_config = aws_config
                .to_builder()
                .region(aws_config::Region::new(ses_region))
                .build();
            SesClient::new(&ses_config)
        } else {
            SesClient::new(&aws_config)
        };

        let provider = HttpKeyProvider::new(
            &config.provider_base_url,
            &config.provider_client_id,
            &config.provider_client_secret,
        )?;

        Ok(Self {
            pool,
            provider: Arc::new(provider),
            mailer: Arc::new(SesTransport::new(ses, &config.ses_from_email)),
            stripe_secret_key: config.stripe_secret_key.clone(),
            stripe_webhook_secret: config.stripe_webhook_secret.clone(),
            allow_unsigned_webhooks: config.allow_unsigned_webhooks,
            provider_backoff: BackoffPolicy::provider(config.provider_max_attempts),
            email_backoff: BackoffPolicy::email(),
        })
    }
}
