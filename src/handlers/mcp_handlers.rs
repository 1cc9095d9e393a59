// handlers/mcp_handlers.rs
use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;
use uuid::Uuid;

use crate::mcp::protocol::{self, RpcReply};
use crate::mcp::tools::{RequestContext, TraceContext};
use crate::state::AppState;

/// Copies UTF-8 header values into a plain map. Names arrive lowercased from
/// the HTTP layer; `-`/`_` folding is left to the credential resolver.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn request_context(uri: &Uri, headers: &HeaderMap) -> RequestContext {
    let trace = TraceContext {
        request_id: Uuid::new_v4().to_string(),
        path: uri.path().to_string(),
        protocol_version: header_value(headers, "mcp-protocol-version"),
        payment_provider: header_value(headers, "payment-provider"),
    };

    RequestContext {
        headers: header_map(headers),
        trace,
    }
}

pub async fn handle_mcp(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = request_context(&uri, &headers);
    debug!(request_id = %ctx.trace.request_id, "Received JSON-RPC message");

    match protocol::handle_message(&state, &ctx, &body).await {
        RpcReply::Response(value) => (StatusCode::OK, Json(value)).into_response(),
        RpcReply::Accepted => StatusCode::ACCEPTED.into_response(),
    }
}
