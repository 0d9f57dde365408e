//! Square webhook verification and the event payloads the billing flow reads.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::stripe_api::SignatureError;

pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

#[derive(Clone)]
pub struct SquareWebhooks {
    signature_key: Option<String>,
    notification_url: Option<String>,
}

impl SquareWebhooks {
    pub fn new(signature_key: Option<String>, notification_url: Option<String>) -> Self {
        Self {
            signature_key,
            notification_url,
        }
    }

    pub fn verify_webhook_signature(&self, signature_header: &str, body: &[u8]) -> Result<(), SignatureError> {
        let (Some(key), Some(url)) = (
            self.signature_key.as_deref(),
            self.notification_url.as_deref(),
        ) else {
            return Err(SignatureError::NotConfigured);
        };
        verify_signature(key, url, signature_header, body)
    }
}

/// base64(HMAC-SHA256(key, notification_url ‖ body)).
pub fn verify_signature(
    signature_key: &str,
    notification_url: &str,
    signature_header: &str,
    body: &[u8],
) -> Result<(), SignatureError> {
    let provided = signature_header.trim();
    if provided.is_empty() {
        return Err(SignatureError::Invalid("missing Square signature"));
    }

    let expected = sign(signature_key, notification_url, body)?;
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Invalid("Square signature mismatch"))
    }
}

pub fn sign(signature_key: &str, notification_url: &str, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(signature_key.as_bytes())
        .map_err(|_| SignatureError::Invalid("invalid Square signature key"))?;
    mac.update(notification_url.as_bytes());
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub data: SquareEventData,
}

impl SquareEvent {
    pub fn occurred_at(&self) -> i64 {
        self.created_at
            .map(|dt| dt.timestamp())
            .unwrap_or_else(|| Utc::now().timestamp())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareEventData {
    #[serde(rename = "type", default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquarePayment {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareSubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub plan_variation_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub charged_through_date: Option<String>,
    #[serde(default)]
    pub canceled_date: Option<String>,
}

impl SquareSubscription {
    pub fn variation_id(&self) -> Option<&str> {
        self.plan_variation_id.as_deref().or(self.plan_id.as_deref())
    }

    /// Square dates are plain `YYYY-MM-DD`; the period ends at midnight UTC.
    pub fn charged_through(&self) -> Option<DateTime<Utc>> {
        parse_square_date(self.charged_through_date.as_deref())
    }

    pub fn is_ended(&self) -> bool {
        matches!(
            self.status.to_ascii_uppercase().as_str(),
            "CANCELED" | "DEACTIVATED"
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareInvoice {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub primary_recipient: Option<SquareRecipient>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SquareRecipient {
    #[serde(default)]
    pub customer_id: Option<String>,
}

pub fn parse_square_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value?.trim(), "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}
