//! Stripe integration via REST API (no SDK dependency)

use hmac::{Hmac, Mac};
use sha2::Sha256;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Webhook events older than this are rejected as replays.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// Create a PaymentIntent carrying order/user correlation metadata.
pub async fn create_payment_intent(
    secret_key: &str,
    amount_cents: i64,
    currency: &str,
    order_id: i64,
    user_id: i64,
) -> Result<PaymentIntent, BoxError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let amount = amount_cents.to_string();
    let order_id = order_id.to_string();
    let user_id = user_id.to_string();
    let resp: serde_json::Value = client
        .post("https://api.stripe.com/v1/payment_intents")
        .basic_auth(secret_key, None::<&str>)
        .form(&[
            ("amount", amount.as_str()),
            ("currency", currency),
            ("metadata[order_id]", order_id.as_str()),
            ("metadata[user_id]", user_id.as_str()),
            ("automatic_payment_methods[enabled]", "true"),
        ])
        .send()
        .await?
        .json()
        .await?;

    match (resp["id"].as_str(), resp["client_secret"].as_str()) {
        (Some(id), Some(client_secret)) => Ok(PaymentIntent {
            id: id.to_string(),
            client_secret: client_secret.to_string(),
        }),
        _ => Err(format!("Stripe create_payment_intent failed: {resp}").into()),
    }
}

/// Verify Stripe webhook signature (HMAC-SHA256)
pub fn verify_webhook_signature(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
) -> Result<(), &'static str> {
    verify_webhook_signature_at(payload, sig_header, secret, chrono::Utc::now().timestamp())
}

/// Signature check against an explicit clock, so tests can pin `now`.
pub fn verify_webhook_signature_at(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
    now_secs: i64,
) -> Result<(), &'static str> {
    let mut timestamp = "";
    let mut signature = "";
    for part in sig_header.split(',') {
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signature = v;
        }
    }

    if timestamp.is_empty() || signature.is_empty() {
        return Err("Invalid Stripe-Signature header");
    }

    // Reject stale timestamps before doing any crypto.
    let ts: i64 = timestamp.parse().map_err(|_| "Invalid timestamp")?;
    if (now_secs - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err("Webhook timestamp too old");
    }

    let signed_payload = format!("{timestamp}.{}", std::str::from_utf8(payload).unwrap_or(""));
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| "HMAC key error")?;
    mac.update(signed_payload.as_bytes());

    // Decode hex signature and use constant-time comparison via hmac::verify_slice
    let sig_bytes = hex::decode(signature).map_err(|_| "Invalid signature hex")?;
    mac.verify_slice(&sig_bytes)
        .map_err(|_| "Webhook signature mismatch")?;

    Ok(())
}

#[cfg(test)]
pub(crate) fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let signed_payload = format!(
        "{timestamp}.{}",
        std::str::from_utf8(payload).unwrap_or("")
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signed_payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign_payload(payload, SECRET, NOW);
        assert!(verify_webhook_signature_at(payload, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign_payload(payload, SECRET, NOW);
        let tampered = br#"{"type":"payment_intent.payment_failed"}"#;
        assert!(verify_webhook_signature_at(tampered, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = br#"{}"#;
        let header = sign_payload(payload, "whsec_other", NOW);
        assert!(verify_webhook_signature_at(payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = br#"{}"#;
        let header = sign_payload(payload, SECRET, NOW - 600);
        assert_eq!(
            verify_webhook_signature_at(payload, &header, SECRET, NOW),
            Err("Webhook timestamp too old")
        );
    }

    #[test]
    fn malformed_header_fails() {
        assert!(verify_webhook_signature_at(b"{}", "v1=abcd", SECRET, NOW).is_err());
        assert!(verify_webhook_signature_at(b"{}", "t=123", SECRET, NOW).is_err());
        assert!(verify_webhook_signature_at(b"{}", "", SECRET, NOW).is_err());
    }
}
