use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::serde_num::{de_i64_lenient, de_opt_i64_lenient, de_opt_progress};

const ADMIN_KEY_HEADER: &str = "X-Admin-Key";
const API_KEY_HEADER: &str = "X-API-Key";
const ACCOUNT_HEADER: &str = "X-Account-Id";

/// Client for the image generation backend, which keeps its own accounts,
/// wallets and API keys.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    admin_key: Option<String>,
    http: reqwest::Client,
}

/// Who a job request is made for.
#[derive(Debug, Clone, Copy)]
pub enum JobAuth<'a> {
    /// Admin key acting for a backend account.
    Account(&'a str),
    /// A user's own API key, forwarded as is.
    ApiKey(&'a str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAccount {
    pub id: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedApiKey {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPackReceipt {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    #[serde(deserialize_with = "de_i64_lenient")]
    pub credits: i64,
    #[serde(default)]
    pub packs: Vec<WalletPack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPack {
    pub id: String,
    #[serde(deserialize_with = "de_i64_lenient")]
    pub credits: i64,
    #[serde(default, deserialize_with = "de_opt_i64_lenient")]
    pub remaining: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    #[serde(alias = "jobId", alias = "id")]
    pub task_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// The job as the backend reports it. `raw` keeps the full document so the
/// public status API can mirror it.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub status: JobState,
    pub progress: Option<u8>,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "succeeded" | "finished" => JobState::Completed,
            "failed" | "failure" | "error" | "canceled" | "cancelled" | "expired" => {
                JobState::Failed
            }
            "running" | "processing" | "in_progress" | "started" => JobState::Running,
            _ => JobState::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Deserialize)]
struct RawJobStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_progress")]
    progress: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffusionRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleRequest {
    pub job_id: String,
    pub index: u8,
}

impl BackendClient {
    pub fn new(base_url: String, admin_key: Option<String>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to create backend HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_key,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("backend health request failed (base_url={})", self.base_url))?;
        if !response.status().is_success() {
            return Err(anyhow!("backend health returned {}", response.status()));
        }
        Ok(())
    }

    pub async fn create_account(
        &self,
        email: &str,
        external_id: &str,
        tier: &str,
    ) -> anyhow::Result<BackendAccount> {
        self.admin_call(
            reqwest::Method::POST,
            "accounts",
            Some(json!({ "email": email, "externalId": external_id, "tier": tier })),
        )
        .await
    }

    pub async fn update_account_tier(&self, account_id: &str, tier: &str) -> anyhow::Result<()> {
        let _value: Value = self
            .admin_call(
                reqwest::Method::PATCH,
                &format!("accounts/{account_id}"),
                Some(json!({ "tier": tier })),
            )
            .await?;
        Ok(())
    }

    pub async fn issue_api_key(&self, account_id: &str, name: &str) -> anyhow::Result<IssuedApiKey> {
        self.admin_call(
            reqwest::Method::POST,
            &format!("accounts/{account_id}/api-keys"),
            Some(json!({ "name": name })),
        )
        .await
    }

    pub async fn revoke_api_key(&self, account_id: &str, key_id: &str) -> anyhow::Result<()> {
        let _value: Value = self
            .admin_call(
                reqwest::Method::DELETE,
                &format!("accounts/{account_id}/api-keys/{key_id}"),
                None,
            )
            .await?;
        Ok(())
    }

    /// `reference` lets the backend drop a pack it has already created.
    pub async fn create_credit_pack(
        &self,
        account_id: &str,
        credits: i64,
        expires_at: Option<DateTime<Utc>>,
        reference: &str,
    ) -> anyhow::Result<CreditPackReceipt> {
        self.admin_call(
            reqwest::Method::POST,
            &format!("accounts/{account_id}/credit-packs"),
            Some(json!({
                "credits": credits,
                "expiresAt": expires_at.map(|dt| dt.to_rfc3339()),
                "reference": reference,
            })),
        )
        .await
    }

    pub async fn get_wallet(&self, account_id: &str) -> anyhow::Result<Wallet> {
        self.admin_call(
            reqwest::Method::GET,
            &format!("accounts/{account_id}/wallet"),
            None,
        )
        .await
    }

    pub async fn submit_diffusion(
        &self,
        auth: JobAuth<'_>,
        request: &DiffusionRequest,
    ) -> anyhow::Result<SubmittedJob> {
        let body = serde_json::to_value(request).context("failed to encode diffusion request")?;
        let value = self
            .job_call(reqwest::Method::POST, "jobs/diffusion", auth, Some(body))
            .await?;
        serde_json::from_value(value).context("failed to decode diffusion submission")
    }

    pub async fn submit_upscale(
        &self,
        auth: JobAuth<'_>,
        request: &UpscaleRequest,
    ) -> anyhow::Result<SubmittedJob> {
        let body = serde_json::to_value(request).context("failed to encode upscale request")?;
        let value = self
            .job_call(reqwest::Method::POST, "jobs/upscale", auth, Some(body))
            .await?;
        serde_json::from_value(value).context("failed to decode upscale submission")
    }

    pub async fn job_status(&self, auth: JobAuth<'_>, task_id: &str) -> anyhow::Result<JobStatus> {
        let raw = self
            .job_call(reqwest::Method::GET, &format!("jobs/{task_id}"), auth, None)
            .await?;
        let parsed: RawJobStatus = serde_json::from_value(raw.clone())
            .with_context(|| format!("failed to decode status for job {task_id}"))?;

        Ok(JobStatus {
            status: JobState::parse(parsed.status.as_deref().unwrap_or_default()),
            progress: parsed.progress,
            raw,
        })
    }

    fn require_admin_key(&self) -> anyhow::Result<&str> {
        self.admin_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("BACKEND_ADMIN_KEY is not configured."))
    }

    async fn admin_call<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<T> {
        let key = self.require_admin_key()?;
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(ADMIN_KEY_HEADER, key);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("backend {} {} failed", method, path))?;
        let value = parse_backend_response(response, path).await?;
        serde_json::from_value(value)
            .with_context(|| format!("failed to decode backend response for {}", path))
    }

    async fn job_call(
        &self,
        method: reqwest::Method,
        path: &str,
        auth: JobAuth<'_>,
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);
        request = match auth {
            JobAuth::Account(account_id) => request
                .header(ADMIN_KEY_HEADER, self.require_admin_key()?)
                .header(ACCOUNT_HEADER, account_id),
            JobAuth::ApiKey(key) => request.header(API_KEY_HEADER, key),
        };
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("backend {} {} failed", method, path))?;
        parse_backend_response(response, path).await
    }
}

async fn parse_backend_response(response: reqwest::Response, path: &str) -> anyhow::Result<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read backend response body for {}", path))?;

    if !status.is_success() {
        return Err(BackendError {
            status: status.as_u16(),
            body: text,
            path: path.to_string(),
        }
        .into());
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("backend returned invalid JSON for {}", path))?;

    // Some endpoints wrap their payload as {"data": ...}.
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

/// Non-2xx answer from the backend, kept typed so callers can tell a missing
/// job from an outage.
#[derive(Debug, thiserror::Error)]
#[error("backend {path} failed with status {status}: {body}")]
pub struct BackendError {
    pub status: u16,
    pub body: String,
    pub path: String,
}

pub fn backend_status(error: &anyhow::Error) -> Option<u16> {
    error.downcast_ref::<BackendError>().map(|error| error.status)
}
