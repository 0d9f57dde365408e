use std::{env, path::PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub database_path: PathBuf,
    pub backend_url: String,
    pub backend_admin_key: Option<String>,
    pub auth_jwt_secret: String,
    pub admin_api_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_api_base: String,
    pub square_webhook_signature_key: Option<String>,
    pub square_webhook_url: Option<String>,
    pub frontend_url: Option<String>,
    pub stripe_price_id_pro_monthly: Option<String>,
    pub stripe_price_id_pro_yearly: Option<String>,
    pub stripe_price_id_credits_small: Option<String>,
    pub stripe_price_id_credits_large: Option<String>,
    pub square_plan_variation_id_pro: Option<String>,
    pub welcome_credits: i64,
    pub pro_monthly_credits: i64,
    pub api_rate_limit_per_window: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 3001);

        let trust_proxy = match env::var("TRUST_PROXY") {
            Ok(value) => {
                let normalized = value.trim().to_lowercase();
                !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
            }
            Err(_) => true,
        };

        let backend_url = env::var("BACKEND_URL")
            .map_err(|_| anyhow::anyhow!("BACKEND_URL environment variable is not set"))?;
        let auth_jwt_secret = env::var("AUTH_JWT_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("AUTH_JWT_SECRET environment variable is not set"))?;

        Ok(Self {
            port,
            trust_proxy,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("imagine-studio.db")),
            backend_url: normalize_base_url(&backend_url),
            backend_admin_key: non_empty(env::var("BACKEND_ADMIN_KEY").ok()),
            auth_jwt_secret,
            admin_api_key: non_empty(env::var("ADMIN_API_KEY").ok()),
            stripe_secret_key: non_empty(env::var("STRIPE_SECRET_KEY").ok()),
            stripe_webhook_secret: non_empty(env::var("STRIPE_WEBHOOK_SECRET").ok()),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .map(|value| normalize_base_url(&value))
                .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
            square_webhook_signature_key: non_empty(env::var("SQUARE_WEBHOOK_SIGNATURE_KEY").ok()),
            square_webhook_url: non_empty(env::var("SQUARE_WEBHOOK_URL").ok()),
            frontend_url: non_empty(env::var("FRONTEND_URL").ok()),
            stripe_price_id_pro_monthly: env::var("STRIPE_PRICE_ID_PRO_MONTHLY").ok(),
            stripe_price_id_pro_yearly: env::var("STRIPE_PRICE_ID_PRO_YEARLY").ok(),
            stripe_price_id_credits_small: env::var("STRIPE_PRICE_ID_CREDITS_SMALL").ok(),
            stripe_price_id_credits_large: env::var("STRIPE_PRICE_ID_CREDITS_LARGE").ok(),
            square_plan_variation_id_pro: env::var("SQUARE_PLAN_VARIATION_ID_PRO").ok(),
            welcome_credits: parse_i64(env::var("WELCOME_CREDITS").ok(), 50),
            pro_monthly_credits: parse_i64(env::var("PRO_MONTHLY_CREDITS").ok(), 2_000),
            api_rate_limit_per_window: parse_usize(env::var("API_RATE_LIMIT").ok(), 300),
        })
    }

    pub fn is_production() -> bool {
        env::var("APP_ENV")
            .ok()
            .map(|value| value.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

// Zero is a valid credit amount, negative is not.
fn parse_i64(value: Option<String>, fallback: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(fallback)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        port: 3001,
        trust_proxy: false,
        tls_key_path: None,
        tls_cert_path: None,
        database_path: ":memory:".into(),
        backend_url: "http://127.0.0.1:1".into(),
        backend_admin_key: Some("admin-key".into()),
        auth_jwt_secret: "test-secret".into(),
        admin_api_key: Some("operator-key".into()),
        stripe_secret_key: None,
        stripe_webhook_secret: Some("whsec_test".into()),
        stripe_api_base: "http://127.0.0.1:1".into(),
        square_webhook_signature_key: Some("sq_key".into()),
        square_webhook_url: Some("https://studio.example.com/api/webhooks/square".into()),
        frontend_url: Some("https://studio.example.com".into()),
        stripe_price_id_pro_monthly: Some("price_pro_m".into()),
        stripe_price_id_pro_yearly: Some("price_pro_y".into()),
        stripe_price_id_credits_small: Some("price_small".into()),
        stripe_price_id_credits_large: Some("price_large".into()),
        square_plan_variation_id_pro: Some("VAR_PRO".into()),
        welcome_credits: 50,
        pro_monthly_credits: 2_000,
        api_rate_limit_per_window: 300,
    }
}
