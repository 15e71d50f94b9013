use std::time::Duration;

use async_trait::async_trait;
use expensa_core::{Notification, NotificationDispatcher, NotificationError};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Expensa-Signature";

/// Posts each notification as JSON to a single endpoint, signed with HMAC-SHA256 over the
/// exact request body.
#[derive(Clone)]
pub struct WebhookNotificationDispatcher {
    client: reqwest::Client,
    url: String,
    signing_secret: SecretString,
}

impl WebhookNotificationDispatcher {
    pub fn new(
        url: impl Into<String>,
        signing_secret: SecretString,
        timeout_secs: u64,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|error| NotificationError(format!("webhook client setup failed: {error}")))?;
        Ok(Self { client, url: url.into(), signing_secret })
    }

    fn signature(&self, body: &[u8]) -> Result<String, NotificationError> {
        sign(self.signing_secret.expose_secret().as_bytes(), body)
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        let body = serde_json::to_vec(&notification)
            .map_err(|error| NotificationError(format!("payload encoding failed: {error}")))?;
        let signature = self.signature(&body)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .body(body)
            .send()
            .await
            .map_err(|error| NotificationError(format!("webhook request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                event_name = "notification.webhook.rejected",
                expense_id = %notification.expense_id,
                kind = notification.kind.as_str(),
                http_status = status.as_u16(),
                "webhook endpoint refused notification"
            );
            return Err(NotificationError(format!("webhook responded with {status}")));
        }

        debug!(
            event_name = "notification.webhook.delivered",
            expense_id = %notification.expense_id,
            recipient_user_id = %notification.recipient_user_id,
            kind = notification.kind.as_str(),
            "notification delivered"
        );
        Ok(())
    }
}

pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, NotificationError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| NotificationError(format!("invalid signing key: {error}")))?;
    mac.update(body);
    Ok(encode_hex(mac.finalize().into_bytes().as_slice()))
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
