//! Mail transport and message templates

use async_trait::async_trait;
use aws_sdk_sesv2::Client as SesClient;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail build error: {0}")]
    Build(String),
    #[error("mail send error: {0}")]
    Send(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<(), MailError>;
}

/// SES v2 implementation of [`MailTransport`]
pub struct SesTransport {
    ses: SesClient,
    from: String,
}

impl SesTransport {
    pub fn new(ses: SesClient, from: &str) -> Self {
        Self {
            ses,
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl MailTransport for SesTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<(), MailError> {
        let subject = Content::builder()
            .data(subject)
            .build()
            .map_err(|e| MailError::Build(e.to_string()))?;

        let mut body = Body::builder().html(
            Content::builder()
                .data(html)
                .build()
                .map_err(|e| MailError::Build(e.to_string()))?,
        );
        if let Some(text) = text {
            body = body.text(
                Content::builder()
                    .data(text)
                    .build()
                    .map_err(|e| MailError::Build(e.to_string()))?,
            );
        }

        let message = Message::builder().subject(subject).body(body.build()).build();

        self.ses
            .send_email()
            .from_email_address(&self.from)
            .destination(Destination::builder().to_addresses(to).build())
            .content(EmailContent::builder().simple(message).build())
            .send()
            .await
            .map_err(|e| MailError::Send(e.to_string()))?;

        tracing::info!(to = to, "Email sent");
        Ok(())
    }
}

/// One consolidated license-key email per order.
pub fn license_keys_email(order_id: i64, keys: &[(String, String)]) -> (String, String, String) {
    let subject = format!("Your license keys for order #{order_id}");

    let mut html_rows = String::new();
    let mut text_rows = String::new();
    for (product, key) in keys {
        html_rows.push_str(&format!(
            "<tr><td>{product}</td><td><code>{key}</code></td></tr>"
        ));
        text_rows.push_str(&format!("{product}: {key}\n"));
    }

    let html = format!(
        "<h2>Order #{order_id} is complete</h2>\
         <p>Thank you for your purchase. Your license keys:</p>\
         <table><tr><th>Product</th><th>Key</th></tr>{html_rows}</table>"
    );
    let text = format!(
        "Order #{order_id} is complete.\n\
         Thank you for your purchase. Your license keys:\n\n{text_rows}"
    );
    (subject, html, text)
}


pub fn payment_failed_email(order_id: i64) -> (String, String, String) {
    let subject = format!("Payment failed for order #{order_id}");
    let html = format!(
        "<h2>Payment failed</h2>\
         <p>We could not process the payment for order #{order_id}.</p>\
         <p>Please try again with a different payment method.</p>"
    );
    let text = format!(
        "We could not process the payment for order #{order_id}.\n\
         Please try again with a different payment method."
    );
    (subject, html, text)
}
