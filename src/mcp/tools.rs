// mcp/tools.rs
use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{error, info, info_span, Instrument};

use crate::errors::ToolError;
use crate::services::mpesa_service::{PaymentRequest, UpstreamResult};
use crate::state::AppState;

pub const STK_PUSH_TOOL: &str = "stk_push";

/// Per-request trace data handed to the tool layer by the HTTP handler.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    pub request_id: String,
    pub path: String,
    pub protocol_version: Option<String>,
    pub payment_provider: Option<String>,
}

/// Everything a tool call may know about the inbound request. Passed
/// explicitly; nothing is kept in task-local state.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: HashMap<String, String>,
    pub trace: TraceContext,
}

/// Text result of a tool call, plus whether it represents a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResponse {
    pub text: String,
    pub is_error: bool,
}

pub fn list_tools() -> Vec<Value> {
    vec![json!({
        "name": STK_PUSH_TOOL,
        "description": "Initiates M-Pesa Express (STK Push) payment on behalf of a customer. Sends a payment prompt to the customer's phone requesting them to enter their M-Pesa PIN to authorize and complete payment.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "amount": {
                    "type": "string",
                    "description": "Amount to be transacted (only whole numbers supported).",
                    "pattern": "^[0-9]+$"
                },
                "phone_number": {
                    "type": "string",
                    "description": "Customer's M-Pesa registered phone number to receive the payment prompt (format: 2547XXXXXXXX).",
                    "pattern": "^2547[0-9]{8}$"
                },
                "account_reference": {
                    "type": "string",
                    "description": "Reference identifier for the transaction (max 12 characters). Shown to the customer in the payment prompt.",
                    "maxLength": 12
                },
                "transaction_desc": {
                    "type": "string",
                    "description": "Description of what the payment is for (max 13 characters).",
                    "maxLength": 13
                }
            },
            "required": ["amount", "phone_number", "account_reference", "transaction_desc"]
        }
    })]
}

pub async fn call_tool(state: &AppState, ctx: &RequestContext, name: &str, arguments: &Value) -> ToolResponse {
    let span = info_span!(
        "tool_call",
        tool = name,
        request_id = %ctx.trace.request_id,
        protocol_version = ctx.trace.protocol_version.as_deref().unwrap_or("-"),
        payment_provider = ctx.trace.payment_provider.as_deref().unwrap_or("-"),
    );

    async {
        match name {
            STK_PUSH_TOOL => render(stk_push(state, ctx, arguments).await),
            other => {
                error!("Unknown tool requested: {}", other);
                ToolResponse {
                    text: format!("Error: Unknown tool '{}'", other),
                    is_error: true,
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Validate, resolve credentials, then hand off to the service. Each step
/// must succeed before the next one starts.
async fn stk_push(state: &AppState, ctx: &RequestContext, arguments: &Value) -> Result<UpstreamResult, ToolError> {
    let request = PaymentRequest::from_arguments(arguments)?;
    let bundle = state.resolver.resolve(&ctx.headers)?;
    info!("Using base URL: {}", bundle.base_url);
    state.mpesa_service.stk_push(&bundle, &request).await
}

fn render(outcome: Result<UpstreamResult, ToolError>) -> ToolResponse {
    let (payload, is_error) = match outcome {
        Ok(UpstreamResult::Success(success)) => {
            let mut payload = json!({ "status": "success" });
            if let (Some(map), Ok(Value::Object(fields))) = (payload.as_object_mut(), serde_json::to_value(&success)) {
                map.extend(fields);
            }
            (payload, false)
        }
        Ok(UpstreamResult::Failure { message, raw }) => {
            (ToolError::UpstreamBusinessError { message, raw }.to_payload(), true)
        }
        Err(err) => {
            match &err {
                ToolError::ValidationError(_) | ToolError::MissingCredentials { .. } => {
                    info!(kind = err.kind(), "STK push rejected: {}", err)
                }
                _ => error!(kind = err.kind(), "STK push failed: {}", err),
            }
            (err.to_payload(), true)
        }
    };

    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    ToolResponse { text, is_error }
}
