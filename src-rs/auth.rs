use anyhow::{anyhow, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Verifies the HS256 session tokens minted by the web frontend.
#[derive(Clone)]
pub struct AuthService {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
}

impl AuthService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.trim().is_empty() {
            return Err(anyhow!("session secret must not be empty"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify_bearer_token(&self, authorization_header: &str) -> anyhow::Result<SessionClaims> {
        let token = extract_bearer_token(authorization_header)?;
        self.verify_token(token)
    }

    pub fn verify_token(&self, token: &str) -> anyhow::Result<SessionClaims> {
        let token_data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .context("session token validation failed")?;

        let claims = token_data.claims;
        if claims.sub.trim().is_empty() {
            return Err(anyhow!("session token has an empty subject"));
        }
        if claims.email.trim().is_empty() {
            return Err(anyhow!("session token has no email"));
        }

        tracing::debug!(sub = %claims.sub, exp = claims.exp, "verified session token");
        Ok(claims)
    }

    /// Mints a token with the same secret; used by tooling and tests.
    pub fn issue_token(&self, claims: &SessionClaims) -> anyhow::Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .context("failed to sign session token")
    }
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(anyhow!("Invalid Authorization header format"));
    }

    Ok(token.trim())
}
