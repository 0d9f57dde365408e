use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    NotConfigured,
    #[error("{0}")]
    Invalid(&'static str),
}

/// What a checkout session sells.
#[derive(Debug, Clone, Copy)]
pub enum CheckoutMode<'a> {
    Subscription { plan: &'a str },
    Payment { pack: &'a str },
}

impl StripeApi {
    pub fn new(
        secret_key: Option<String>,
        webhook_secret: Option<String>,
        base_url: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> Result<(), SignatureError> {
        let webhook_secret = self
            .webhook_secret
            .as_deref()
            .ok_or(SignatureError::NotConfigured)?;
        verify_signature(
            webhook_secret,
            signature_header,
            payload,
            Utc::now().timestamp(),
        )
    }

    pub async fn create_customer(&self, email: &str, user_id: &str) -> anyhow::Result<StripeCustomer> {
        let params = vec![
            ("email".to_string(), email.to_string()),
            ("metadata[userId]".to_string(), user_id.to_string()),
        ];
        self.post_form("customers", &params).await
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> anyhow::Result<StripeCustomer> {
        self.get_json(&format!("customers/{}", customer_id), &[])
            .await
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        user_id: &str,
        price_id: &str,
        mode: CheckoutMode<'_>,
        success_url: &str,
        cancel_url: &str,
    ) -> anyhow::Result<StripeCheckoutSession> {
        let mut params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("client_reference_id".to_string(), user_id.to_string()),
            ("metadata[userId]".to_string(), user_id.to_string()),
            ("line_items[0][price]".to_string(), price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
        ];

        match mode {
            CheckoutMode::Subscription { plan } => {
                params.push(("mode".to_string(), "subscription".to_string()));
                params.push(("metadata[plan]".to_string(), plan.to_string()));
                params.push((
                    "subscription_data[metadata][userId]".to_string(),
                    user_id.to_string(),
                ));
            }
            CheckoutMode::Payment { pack } => {
                params.push(("mode".to_string(), "payment".to_string()));
                params.push(("metadata[pack]".to_string(), pack.to_string()));
            }
        }

        self.post_form("checkout/sessions", &params).await
    }

    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> anyhow::Result<StripeBillingPortalSession> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];

        self.post_form("billing_portal/sessions", &params).await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }

    pub fn is_configured(&self) -> bool {
        self.require_secret_key().is_ok()
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .form(params)
            .send()
            .await
            .with_context(|| format!("Stripe POST failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }
}

/// `Stripe-Signature: t=<unix>,v1=<hex hmac>[,v1=...]` over `"{t}.{payload}"`.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    payload: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut pieces = part.trim().splitn(2, '=');
        let key = pieces.next().unwrap_or_default();
        let value = pieces.next().unwrap_or_default();
        if key == "t" {
            timestamp = value.parse::<i64>().ok();
        } else if key == "v1" {
            v1_signatures.push(value);
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Invalid("missing Stripe timestamp"))?;
    if v1_signatures.is_empty() {
        return Err(SignatureError::Invalid("missing Stripe v1 signature"));
    }
    let skew = now.checked_sub(timestamp).map(i64::unsigned_abs);
    if !matches!(skew, Some(skew) if skew <= SIGNATURE_TOLERANCE_SECS) {
        return Err(SignatureError::Invalid("Stripe timestamp outside tolerance"));
    }

    let expected = sign_payload(secret, timestamp, payload)?;
    let is_match = v1_signatures
        .into_iter()
        .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

    if !is_match {
        return Err(SignatureError::Invalid("Stripe signature mismatch"));
    }

    Ok(())
}

pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Invalid("invalid Stripe webhook secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeBillingPortalSession {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: IdOrObject,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub items: StripeList<StripeSubscriptionItem>,
}

impl StripeSubscription {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.id.as_deref())
    }

    /// Newer API versions moved the period end onto the item.
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .data
                .first()
                .and_then(|item| item.current_period_end)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub price: Option<StripePrice>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> &str {
        match self {
            IdOrObject::Id(value) => value,
            IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub subscription: Option<IdOrObject>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub lines: Option<StripeList<StripeInvoiceLine>>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

impl StripeInvoice {
    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .as_ref()?
            .data
            .iter()
            .find_map(|line| line.price.as_ref().and_then(|price| price.id.as_deref()))
    }

    /// End of the service period the invoice pays for.
    pub fn service_period_end(&self) -> Option<i64> {
        self.lines
            .as_ref()
            .and_then(|lines| lines.data.iter().find_map(|line| line.period.as_ref()))
            .map(|period| period.end)
            .or(self.period_end)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLine {
    #[serde(default)]
    pub price: Option<StripePrice>,
    #[serde(default)]
    pub period: Option<StripePeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePeriod {
    pub start: i64,
    pub end: i64,
}
