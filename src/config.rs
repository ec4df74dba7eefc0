//! Service configuration

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Service configuration, loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// HTTP port
    pub http_port: u16,
    /// Environment: development | staging | production
    pub environment: String,
    /// Stripe secret key
    pub stripe_secret_key: String,
    /// Stripe webhook signing secret
    pub stripe_webhook_secret: String,
    /// Accept webhooks without a signature header (never honored in production)
    pub allow_unsigned_webhooks: bool,
    /// Key-provider API base URL
    pub provider_base_url: String,
    /// Key-provider OAuth client id
    pub provider_client_id: String,
    /// Key-provider OAuth client secret
    pub provider_client_secret: String,
    /// SES sender email address
    pub ses_from_email: String,
    /// Max attempts for provider create/pay/fetch retries
    pub provider_max_attempts: u32,
    /// Email delivery sweep interval (seconds)
    pub email_sweep_secs: u64,
    /// Pending-order expiry sweep interval (seconds)
    pub expiry_sweep_secs: u64,
    /// Retention prune interval (seconds)
    pub prune_sweep_secs: u64,
}

impl Config {
    /// Require a secret env var: must be set and non-empty in non-development environments.
    fn require_secret(name: &str, environment: &str) -> Result<String, BoxError> {
        let val = match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                if environment != "development" {
                    return Err(format!("{name} must be set in {environment} environment").into());
                }
                format!("dev-{name}-not-for-production")
            }
        };
        if val.is_empty() && environment != "development" {
            return Err(format!("{name} must not be empty in {environment} environment").into());
        }
        Ok(val)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let allow_unsigned_webhooks = std::env::var("ALLOW_UNSIGNED_WEBHOOKS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if allow_unsigned_webhooks && environment == "production" {
            return Err("ALLOW_UNSIGNED_WEBHOOKS must not be set in production".into());
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?,
            http_port: std::env::var("HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            environment: environment.clone(),
            stripe_secret_key: Self::require_secret("STRIPE_SECRET_KEY", &environment)?,
            stripe_webhook_secret: Self::require_secret("STRIPE_WEBHOOK_SECRET", &environment)?,
            allow_unsigned_webhooks,
            provider_base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.keyprovider.example".into()),
            provider_client_id: Self::require_secret("PROVIDER_CLIENT_ID", &environment)?,
            provider_client_secret: Self::require_secret("PROVIDER_CLIENT_SECRET", &environment)?,
            ses_from_email: std::env::var("SES_FROM_EMAIL")
                .unwrap_or_else(|_| "noreply@keyharbor.app".into()),
            provider_max_attempts: std::env::var("PROVIDER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            email_sweep_secs: std::env::var("EMAIL_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            expiry_sweep_secs: std::env::var("EXPIRY_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            prune_sweep_secs: std::env::var("PRUNE_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        })
    }
}
