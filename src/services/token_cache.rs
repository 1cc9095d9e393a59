// services/token_cache.rs
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::errors::AuthError;
use crate::services::credentials::CredentialBundle;

/// A cached token stops being handed out this long before its nominal expiry.
pub const EXPIRY_SKEW_SECS: i64 = 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
/// Upper bound on the lifetime we will honour, whatever the gateway claims.
pub const MAX_EXPIRES_IN_SECS: i64 = 86_400;

/// OAuth bearer token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: AccessToken,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS)
    }
}

/// Cache entries are scoped to the full client identity, secret included, so a
/// caller holding only a tenant's consumer key never receives that tenant's token.
#[derive(Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("base_url", &self.base_url)
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"***")
            .finish()
    }
}

impl From<&CredentialBundle> for TokenKey {
    fn from(bundle: &CredentialBundle) -> Self {
        TokenKey {
            base_url: bundle.base_url.clone(),
            consumer_key: bundle.consumer_key.clone(),
            consumer_secret: bundle.consumer_secret.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

/// `Authorization` value for the client-credentials exchange.
pub fn basic_auth_header(consumer_key: &str, consumer_secret: &str) -> String {
    let auth_string = format!("{}:{}", consumer_key, consumer_secret);
    format!("Basic {}", base64.encode(auth_string))
}

/// Daraja sends `expires_in` as a string; other gateways send a number.
/// Negative lifetimes are rejected and anything above a day is capped.
fn parse_expires_in(value: Option<&Value>) -> Result<i64, AuthError> {
    let secs = match value {
        None | Some(Value::Null) => Ok(DEFAULT_EXPIRES_IN_SECS),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| AuthError::MalformedResponse(format!("expires_in is not an integer: {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| AuthError::MalformedResponse(format!("expires_in is not an integer: '{}'", s))),
        Some(other) => Err(AuthError::MalformedResponse(format!(
            "expires_in has unexpected type: {}",
            other
        ))),
    }?;

    if secs < 0 {
        return Err(AuthError::MalformedResponse(format!("expires_in is negative: {}", secs)));
    }
    Ok(secs.min(MAX_EXPIRES_IN_SECS))
}

/// Per-tenant OAuth token cache.
///
/// Concurrent refreshes for the same tenant are not serialized: both fetch,
/// and the last one to finish wins. The lock is only held for the map read or
/// write, never across the HTTP call.
#[derive(Debug, Clone)]
pub struct TokenCache {
    client: Client,
    oauth_path: String,
    timeout: Duration,
    entries: Arc<RwLock<HashMap<TokenKey, CachedToken>>>,
}

impl TokenCache {
    pub fn new(client: Client, oauth_path: impl Into<String>, timeout: Duration) -> Self {
        TokenCache {
            client,
            oauth_path: oauth_path.into(),
            timeout,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the cached entry for `bundle` if there is one, fresh or not.
    pub async fn cached(&self, bundle: &CredentialBundle) -> Option<CachedToken> {
        self.entries.read().await.get(&TokenKey::from(bundle)).cloned()
    }

    /// Seeds the cache, e.g. with a token obtained out of band. Entries that are
    /// no longer fresh are evicted on the way in.
    pub async fn insert(&self, bundle: &CredentialBundle, token: CachedToken) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, cached| cached.is_fresh(now));
        entries.insert(TokenKey::from(bundle), token);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn get_token(
        &self,
        bundle: &CredentialBundle,
        force_refresh: bool,
    ) -> Result<AccessToken, AuthError> {
        if !force_refresh {
            if let Some(cached) = self.cached(bundle).await {
                if cached.is_fresh(Utc::now()) {
                    debug!("Using cached access token");
                    return Ok(cached.access_token);
                }
            }
        }

        let fetched = self.fetch(bundle).await?;
        let token = fetched.access_token.clone();
        self.insert(bundle, fetched).await;
        Ok(token)
    }

    async fn fetch(&self, bundle: &CredentialBundle) -> Result<CachedToken, AuthError> {
        info!("Requesting new M-Pesa access token");

        let url = format!("{}{}", bundle.base_url, self.oauth_path);
        let response = self
            .client
            .get(&url)
            .query(&[("grant_type", "client_credentials")])
            .header(
                header::AUTHORIZATION,
                basic_auth_header(&bundle.consumer_key, &bundle.consumer_secret),
            )
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to obtain M-Pesa access token: {}", e);
                AuthError::Transport(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !status.is_success() {
            error!("Failed to get access token: {} - {}", status, body);
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let auth_response: AuthResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        let access_token = auth_response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::MalformedResponse("missing access_token".to_string()))?;
        let expires_in = parse_expires_in(auth_response.expires_in.as_ref())?;

        let expires_at = Utc::now()
            .checked_add_signed(chrono::Duration::seconds(expires_in))
            .ok_or_else(|| AuthError::MalformedResponse(format!("expires_in out of range: {}", expires_in)))?;

        info!("M-Pesa access token obtained, expires in {} seconds", expires_in);

        Ok(CachedToken {
            access_token: AccessToken(access_token),
            expires_at,
        })
    }
}
