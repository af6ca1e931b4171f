//! Gateway authentication.
//!
//! With the `keystone` strategy every request carries an `X-Auth-Token`
//! issued by Keystone v3 password auth. The token is cached and re-issued
//! once it is within a minute of expiring, or after the gateway rejected it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::DockError;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    Keystone,
    #[default]
    Noauth,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) id: String,
    pub(crate) expires_at: DateTime<Utc>,
}

impl Token {
    pub(crate) fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - chrono::Duration::minutes(1)
    }
}

#[derive(Deserialize)]
struct TokenBody {
    token: TokenInfo,
}

#[derive(Deserialize)]
struct TokenInfo {
    expires_at: DateTime<Utc>,
}

/// Credentials plus the cached token.
pub struct AuthSession {
    strategy: AuthStrategy,
    auth_url: String,
    domain: String,
    username: String,
    password: String,
    tenant: String,
    token: Mutex<Option<Token>>,
}

impl AuthSession {
    pub fn noauth() -> Self {
        Self::new(AuthStrategy::Noauth, "", "", "", "", "")
    }

    pub fn new(
        strategy: AuthStrategy,
        auth_url: &str,
        domain: &str,
        username: &str,
        password: &str,
        tenant: &str,
    ) -> Self {
        Self {
            strategy,
            auth_url: auth_url.trim_end_matches('/').to_owned(),
            domain: domain.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            tenant: tenant.to_owned(),
            token: Mutex::new(None),
        }
    }

    /// Token to send, issuing a new one when the cached one is stale.
    /// `None` with the `noauth` strategy.
    pub async fn token(&self, http: &reqwest::Client) -> Result<Option<String>, DockError> {
        if self.strategy == AuthStrategy::Noauth {
            return Ok(None);
        }
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.needs_refresh(Utc::now())) {
            return Ok(Some(token.id.clone()));
        }
        let token = self.issue(http).await?;
        let id = token.id.clone();
        *cached = Some(token);
        Ok(Some(id))
    }

    /// Drop the cached token after the gateway rejected it.
    pub async fn invalidate(&self) {
        self.token.lock().await.take();
    }

    #[instrument(skip(self, http), fields(user = %self.username))]
    async fn issue(&self, http: &reqwest::Client) -> Result<Token, DockError> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.domain },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.tenant,
                        "domain": { "name": self.domain },
                    }
                }
            }
        });
        let url = format!("{}/auth/tokens", self.auth_url);
        debug!(%url, "requesting token");
        let resp = http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(DockError::transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DockError::Auth(format!("keystone rejected {}: {status}", self.username)));
        }
        if !status.is_success() {
            return Err(DockError::Auth(format!("keystone answered {status}")));
        }
        let id = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| DockError::Auth("keystone response has no token".into()))?;
        let body: TokenBody = resp.json().await.map_err(DockError::transport)?;
        info!(expires_at = %body.token.expires_at, "token issued");
        Ok(Token {
            id,
            expires_at: body.token.expires_at,
        })
    }
}
