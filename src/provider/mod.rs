//! Key-provider adapter
//!
//! Provisioning runs create → pay → fetch-key against the provider's REST
//! API. `KeyProvider` is the seam the orchestrator works through; the HTTP
//! implementation lives here together with the OAuth token cache.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Sentinel stored when the provider insists a key was already delivered but
/// will not hand it over again.
pub const KEY_ALREADY_DELIVERED: &str = "KEY_ALREADY_DELIVERED";

/// Provider error codes with defined semantics. Anything else is `Unknown`.
pub mod code {
    pub const INVALID_ORDER: &str = "ORD01";
    pub const KEY_NOT_READY: &str = "ORD03";
    pub const ALREADY_DELIVERED: &str = "ORD04";
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider auth error: {0}")]
    Auth(String),
    #[error("provider api error {code}: {message}")]
    Api { code: String, message: String },
}

/// Classified result of a key fetch. Closed set: the orchestrator matches
/// exhaustively and never branches on raw codes.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFetch {
    Delivered(String),
    NotReady,
    /// Provider reports prior delivery; it may or may not include the key.
    AlreadyDelivered(Option<String>),
    InvalidOrder,
    Unknown(String),
}

/// Map a provider error code to a fetch classification.
pub fn classify_code(code: &str, key: Option<String>) -> KeyFetch {
    match code {
        code::KEY_NOT_READY => KeyFetch::NotReady,
        code::ALREADY_DELIVERED => KeyFetch::AlreadyDelivered(key),
        code::INVALID_ORDER => KeyFetch::InvalidOrder,
        other => KeyFetch::Unknown(other.to_string()),
    }
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Place a provider-side order for one product. Returns the provider order id.
    async fn create_order(&self, product_id: &str) -> Result<String, ProviderError>;
    /// Pay a provider-side order. Returns the provider transaction id.
    async fn pay_order(&self, provider_order_id: &str) -> Result<String, ProviderError>;
    /// Fetch the license key for a paid provider order.
    async fn fetch_key(&self, provider_order_id: &str) -> Result<KeyFetch, ProviderError>;
}

/// Cached OAuth client-credentials token.
#[derive(Default)]
struct TokenCache {
    token: Option<String>,
    expires_at_ms: i64,
}

/// HTTP implementation of [`KeyProvider`].
pub struct HttpKeyProvider {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<TokenCache>,
}

impl HttpKeyProvider {
    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(TokenCache::default()),
        })
    }

    /// Bearer token, refreshed when missing or within a minute of expiry.
    async fn bearer(&self) -> Result<String, ProviderError> {
        let mut cache = self.token.lock().await;
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(ref token) = cache.token {
            if cache.expires_at_ms > now + 60_000 {
                return Ok(token.clone());
            }
        }

        let resp: serde_json::Value = self
            .client
            .post(format!("{}/oauth/token", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?
            .json()
            .await?;

        let token = resp["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::Auth(format!("token response missing access_token: {resp}")))?
            .to_string();
        let expires_in = resp["expires_in"].as_i64().unwrap_or(3600);

        cache.expires_at_ms = now + expires_in * 1000;
        cache.token = Some(token.clone());
        Ok(token)
    }

    /// Pull `{code, message}` out of a non-2xx response body.
    async fn api_error(resp: reqwest::Response) -> ProviderError {
        let status = resp.status();
        match resp.json::<serde_json::Value>().await {
            Ok(body) => ProviderError::Api {
                code: body["code"].as_str().unwrap_or("UNKNOWN").to_string(),
                message: body["message"]
                    .as_str()
                    .unwrap_or("no message")
                    .to_string(),
            },
            Err(_) => ProviderError::Api {
                code: "UNKNOWN".to_string(),
                message: format!("http status {status}"),
            },
        }
    }
}

#[async_trait]
impl KeyProvider for HttpKeyProvider {
    async fn create_order(&self, product_id: &str) -> Result<String, ProviderError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({ "product_id": product_id }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body: serde_json::Value = resp.json().await?;
        body["order_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Api {
                code: "UNKNOWN".to_string(),
                message: format!("create order response missing order_id: {body}"),
            })
    }

    async fn pay_order(&self, provider_order_id: &str) -> Result<String, ProviderError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .put(format!(
                "{}/v1/orders/{provider_order_id}/pay",
                self.base_url
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body: serde_json::Value = resp.json().await?;
        body["transaction_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Api {
                code: "UNKNOWN".to_string(),
                message: format!("pay response missing transaction_id: {body}"),
            })
    }

    async fn fetch_key(&self, provider_order_id: &str) -> Result<KeyFetch, ProviderError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!(
                "{}/v1/orders/{provider_order_id}/key",
                self.base_url
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if resp.status().is_success() {
            let body: serde_json::Value = resp.json().await?;
            return match body["key"].as_str() {
                Some(key) => Ok(KeyFetch::Delivered(key.to_string())),
                None => Ok(KeyFetch::NotReady),
            };
        }

        // Error bodies carry the classification. Some ORD04 responses include
        // the previously delivered key.
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let code = body["code"].as_str().unwrap_or("UNKNOWN").to_string();
        let key = body["key"].as_str().map(String::from);
        tracing::debug!(code = %code, %status, "Provider key fetch refused");
        Ok(classify_code(&code, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_classify_exactly() {
        assert_eq!(classify_code("ORD03", None), KeyFetch::NotReady);
        assert_eq!(classify_code("ORD01", None), KeyFetch::InvalidOrder);
        assert_eq!(
            classify_code("ORD04", None),
            KeyFetch::AlreadyDelivered(None)
        );
        assert_eq!(
            classify_code("ORD04", Some("K-1".into())),
            KeyFetch::AlreadyDelivered(Some("K-1".into()))
        );
    }

    #[test]
    fn unknown_codes_stay_unknown() {
        assert_eq!(
            classify_code("ORD99", None),
            KeyFetch::Unknown("ORD99".into())
        );
        assert_eq!(classify_code("", None), KeyFetch::Unknown("".into()));
    }
}
