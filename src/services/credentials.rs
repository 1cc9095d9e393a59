// services/credentials.rs
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use tracing::info;

use crate::config::{AppConfig, CredentialSource};
use crate::errors::ToolError;

pub const BASE_URL: &str = "mpesa_base_url";
pub const BUSINESS_SHORTCODE: &str = "mpesa_business_shortcode";
pub const PASSKEY: &str = "mpesa_passkey";
pub const CALLBACK_URL: &str = "mpesa_callback_url";
pub const CONSUMER_KEY: &str = "mpesa_consumer_key";
pub const CONSUMER_SECRET: &str = "mpesa_consumer_secret";

/// Everything needed to talk to Daraja on behalf of one tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub base_url: String,
    pub business_short_code: String,
    pub passkey: String,
    pub callback_url: String,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"***")
            .field("base_url", &self.base_url)
            .field("business_short_code", &self.business_short_code)
            .field("passkey", &"***")
            .field("callback_url", &self.callback_url)
            .finish()
    }
}

impl CredentialBundle {
    /// Builds a bundle from six optional values, failing if any is absent or blank.
    fn from_parts(
        consulted: CredentialSource,
        base_url: Option<&str>,
        business_short_code: Option<&str>,
        passkey: Option<&str>,
        callback_url: Option<&str>,
        consumer_key: Option<&str>,
        consumer_secret: Option<&str>,
    ) -> Result<Self, ToolError> {
        let fields = [
            (BASE_URL, base_url),
            (BUSINESS_SHORTCODE, business_short_code),
            (PASSKEY, passkey),
            (CALLBACK_URL, callback_url),
            (CONSUMER_KEY, consumer_key),
            (CONSUMER_SECRET, consumer_secret),
        ];

        info!(
            source = consulted.as_str(),
            base_url = present(base_url),
            shortcode = present(business_short_code),
            callback = present(callback_url),
            passkey = present(passkey),
            consumer_key = present(consumer_key),
            consumer_secret = present(consumer_secret),
            "M-Pesa credential presence"
        );

        let missing: Vec<&'static str> = fields
            .iter()
            .filter(|(_, value)| !present(*value))
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(ToolError::MissingCredentials { consulted, missing });
        }

        let take = |value: Option<&str>| value.map(|v| v.trim().to_string()).unwrap_or_default();

        Ok(CredentialBundle {
            base_url: take(base_url).trim_end_matches('/').to_string(),
            business_short_code: take(business_short_code),
            passkey: take(passkey),
            callback_url: take(callback_url),
            consumer_key: take(consumer_key),
            consumer_secret: take(consumer_secret),
        })
    }
}

fn present(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Lowercases header names and folds `-` into `_` so that `MPESA-PASSKEY`,
/// `mpesa-passkey` and `mpesa_passkey` all land on the same key.
///
/// When several spellings collide, the first non-blank value wins, visiting
/// the exact canonical spelling first and the rest in name order.
pub fn normalize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut entries: Vec<(String, &String, &String)> = headers
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_lowercase().replace('-', "_"), k, v))
        .collect();
    entries.sort_by(|a, b| (*a.1 != a.0, a.1).cmp(&(*b.1 != b.0, b.1)));

    let mut normalized: HashMap<String, String> = HashMap::with_capacity(entries.len());
    for (key, _, value) in entries {
        match normalized.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
            Entry::Occupied(mut slot) if slot.get().trim().is_empty() => {
                slot.insert(value.clone());
            }
            Entry::Occupied(_) => {}
        }
    }
    normalized
}

/// Resolves a bundle from per-call headers (multi-tenant mode).
pub fn resolve_from_headers(headers: &HashMap<String, String>) -> Result<CredentialBundle, ToolError> {
    let h = normalize_headers(headers);
    let get = |key: &str| h.get(key).map(String::as_str);

    CredentialBundle::from_parts(
        CredentialSource::Headers,
        get(BASE_URL),
        get(BUSINESS_SHORTCODE),
        get(PASSKEY),
        get(CALLBACK_URL),
        get(CONSUMER_KEY),
        get(CONSUMER_SECRET),
    )
}

/// Resolves a bundle from process configuration (single-tenant mode).
pub fn resolve_from_config(config: &AppConfig) -> Result<CredentialBundle, ToolError> {
    let creds = &config.env_credentials;

    CredentialBundle::from_parts(
        CredentialSource::Environment,
        Some(config.mpesa_base_url()),
        creds.business_short_code.as_deref(),
        creds.passkey.as_deref(),
        creds.callback_url.as_deref(),
        creds.consumer_key.as_deref(),
        creds.consumer_secret.as_deref(),
    )
}

/// Picks the credential source configured for the process.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    config: AppConfig,
}

impl CredentialResolver {
    pub fn new(config: AppConfig) -> Self {
        CredentialResolver { config }
    }

    pub fn resolve(&self, headers: &HashMap<String, String>) -> Result<CredentialBundle, ToolError> {
        match self.config.credential_source {
            CredentialSource::Headers => resolve_from_headers(headers),
            CredentialSource::Environment => resolve_from_config(&self.config),
        }
    }
}
