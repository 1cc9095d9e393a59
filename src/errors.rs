// src/errors.rs
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::CredentialSource;

/// Process-level failures: anything that stops the server from starting.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(#[from] reqwest::Error),
}

impl AppError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }
}

/// Failures while acquiring an OAuth access token.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to obtain M-Pesa access token: {0}")]
    Transport(String),

    #[error("HTTP error when obtaining M-Pesa access token: {status}")]
    Status { status: u16, body: String },

    #[error("Invalid response format from M-Pesa OAuth endpoint: {0}")]
    MalformedResponse(String),
}

impl AuthError {
    pub fn subkind(&self) -> &'static str {
        match self {
            AuthError::Transport(_) => "transport",
            AuthError::Status { .. } => "status",
            AuthError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Every way a single tool invocation can fail. None of these cross the tool
/// boundary: they are rendered into the text payload by [`ToolError::to_payload`].
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Missing one or more M-Pesa credentials in {}: {}", consulted.as_str(), missing.join(", "))]
    MissingCredentials {
        consulted: CredentialSource,
        missing: Vec<&'static str>,
    },

    #[error(transparent)]
    AuthError(#[from] AuthError),

    #[error("HTTP request failed")]
    UpstreamHttpError { status: u16, body: String },

    #[error("{message}")]
    UpstreamBusinessError { message: String, raw: Value },

    #[error("Request failed: {0}")]
    UnexpectedError(String),
}

impl ToolError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ToolError::ValidationError(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        ToolError::UnexpectedError(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::ValidationError(_) => "ValidationError",
            ToolError::MissingCredentials { .. } => "MissingCredentials",
            ToolError::AuthError(_) => "AuthError",
            ToolError::UpstreamHttpError { .. } => "UpstreamHTTPError",
            ToolError::UpstreamBusinessError { .. } => "UpstreamBusinessError",
            ToolError::UnexpectedError(_) => "UnexpectedError",
        }
    }

    /// Structured `{status, kind, message, code?, raw?}` shape returned to the caller.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "status": "error",
            "kind": self.kind(),
            "message": self.to_string(),
        });

        match self {
            ToolError::UpstreamHttpError { status, body } => {
                payload["code"] = json!(status);
                payload["raw"] = json!(body);
            }
            ToolError::UpstreamBusinessError { raw, .. } => {
                payload["raw"] = raw.clone();
            }
            ToolError::AuthError(auth) => {
                payload["auth_error"] = json!(auth.subkind());
                if let AuthError::Status { status, body } = auth {
                    payload["code"] = json!(status);
                    payload["raw"] = json!(body);
                }
            }
            ToolError::MissingCredentials { consulted, missing } => {
                payload["source"] = json!(consulted.as_str());
                payload["missing"] = json!(missing);
            }
            _ => {}
        }

        payload
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        ToolError::UnexpectedError(err.to_string())
    }
}
