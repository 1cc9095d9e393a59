// config.rs
use std::env;
use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_SANDBOX_URL: &str = "https://sandbox.safaricom.co.ke";
const DEFAULT_PRODUCTION_URL: &str = "https://api.safaricom.co.ke";
const DEFAULT_OAUTH_ENDPOINT: &str = "/oauth/v1/generate";

/// Where per-call M-Pesa credentials come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Multi-tenant: every call carries its own credentials as request headers.
    Headers,
    /// Single-tenant: credentials are read from the process environment.
    Environment,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Headers => "request headers",
            CredentialSource::Environment => "environment",
        }
    }
}

impl std::str::FromStr for CredentialSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headers" | "header" => Ok(CredentialSource::Headers),
            "environment" | "env" => Ok(CredentialSource::Environment),
            other => Err(AppError::configuration(format!(
                "MPESA_CREDENTIAL_SOURCE must be 'headers' or 'environment', got '{}'",
                other
            ))),
        }
    }
}

/// Credentials as found in the environment. Individual values may be missing;
/// completeness is checked per call by the credential resolver.
#[derive(Clone, Default)]
pub struct EnvCredentials {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub business_short_code: Option<String>,
    pub passkey: Option<String>,
    pub callback_url: Option<String>,
}

impl std::fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentials")
            .field("consumer_key_set", &self.consumer_key.is_some())
            .field("consumer_secret_set", &self.consumer_secret.is_some())
            .field("business_short_code", &self.business_short_code)
            .field("passkey_set", &self.passkey.is_some())
            .field("callback_url", &self.callback_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credential_source: CredentialSource,
    pub mpesa_environment: String,
    pub mpesa_sandbox_url: String,
    pub mpesa_production_url: String,
    pub mpesa_oauth_endpoint: String,
    pub http_timeout: Duration,
    pub env_credentials: EnvCredentials,
    pub log_level: String,
    pub port: u16,
    pub host: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            credential_source: CredentialSource::Headers,
            mpesa_environment: "sandbox".to_string(),
            mpesa_sandbox_url: DEFAULT_SANDBOX_URL.to_string(),
            mpesa_production_url: DEFAULT_PRODUCTION_URL.to_string(),
            mpesa_oauth_endpoint: DEFAULT_OAUTH_ENDPOINT.to_string(),
            http_timeout: Duration::from_secs(30),
            env_credentials: EnvCredentials::default(),
            log_level: "info".to_string(),
            port: 5002,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Empty values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = AppConfig::default();

        let credential_source = match var("MPESA_CREDENTIAL_SOURCE") {
            Some(raw) => raw.parse()?,
            None => defaults.credential_source,
        };

        let port = match var("MPESA_MCP_SERVER_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                AppError::configuration(format!("MPESA_MCP_SERVER_PORT must be a number, got '{}'", raw))
            })?,
            None => defaults.port,
        };

        let http_timeout = match var("MPESA_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    AppError::configuration(format!("MPESA_HTTP_TIMEOUT_SECS must be a number, got '{}'", raw))
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.http_timeout,
        };

        let mut oauth_endpoint = var("MPESA_OAUTH_ENDPOINT").unwrap_or(defaults.mpesa_oauth_endpoint);
        if !oauth_endpoint.starts_with('/') {
            oauth_endpoint.insert(0, '/');
        }

        Ok(AppConfig {
            credential_source,
            mpesa_environment: var("MPESA_ENVIRONMENT")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or(defaults.mpesa_environment),
            mpesa_sandbox_url: var("MPESA_SANDBOX_URL").unwrap_or(defaults.mpesa_sandbox_url),
            mpesa_production_url: var("MPESA_PRODUCTION_URL").unwrap_or(defaults.mpesa_production_url),
            mpesa_oauth_endpoint: oauth_endpoint,
            http_timeout,
            env_credentials: EnvCredentials {
                consumer_key: var("MPESA_CONSUMER_KEY"),
                consumer_secret: var("MPESA_CONSUMER_SECRET"),
                business_short_code: var("MPESA_BUSINESS_SHORTCODE"),
                passkey: var("MPESA_PASSKEY"),
                callback_url: var("MPESA_CALLBACK_URL"),
            },
            log_level: var("LOG_LEVEL").unwrap_or(defaults.log_level),
            port,
            host: var("HOST").unwrap_or(defaults.host),
        })
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    /// Base URL used when credentials come from the environment.
    pub fn mpesa_base_url(&self) -> &str {
        if self.is_production() {
            &self.mpesa_production_url
        } else {
            &self.mpesa_sandbox_url
        }
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        let creds = &self.env_credentials;
        serde_json::json!({
            "credential_source": self.credential_source.as_str(),
            "environment": self.mpesa_environment,
            "is_production": self.is_production(),
            "oauth_endpoint": self.mpesa_oauth_endpoint,
            "http_timeout_secs": self.http_timeout.as_secs(),
            "consumer_key_set": creds.consumer_key.is_some(),
            "consumer_secret_set": creds.consumer_secret.is_some(),
            "business_shortcode_set": creds.business_short_code.is_some(),
            "passkey_set": creds.passkey.is_some(),
            "callback_url_set": creds.callback_url.is_some(),
        })
    }
}
