// JSON-RPC 2.0 message handling for the tool interface.
//
// Stateless: each POST carries one message and gets one reply. No sessions,
// no server-sent events.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::mcp::tools::{self, RequestContext};
use crate::state::AppState;

pub const SERVER_NAME: &str = "mpesa_mcp_server";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// What the HTTP layer should send back.
#[derive(Debug, PartialEq)]
pub enum RpcReply {
    Response(Value),
    /// The message was a notification; there is nothing to answer.
    Accepted,
}

pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

fn result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub async fn handle_message(state: &AppState, ctx: &RequestContext, body: &[u8]) -> RpcReply {
    let raw: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Rejecting unparseable JSON-RPC body: {}", e);
            return RpcReply::Response(error_response(Value::Null, PARSE_ERROR, "Parse error"));
        }
    };

    // `"id": null` is still a request; only an absent id marks a notification.
    let has_id = raw.get("id").is_some();

    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return RpcReply::Response(error_response(
                Value::Null,
                INVALID_REQUEST,
                format!("Invalid request: {}", e),
            ))
        }
    };

    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return RpcReply::Response(error_response(
            request.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Only JSON-RPC 2.0 is supported",
        ));
    }

    if !has_id {
        debug!(method = %request.method, "Notification received");
        return RpcReply::Accepted;
    }
    let id = request.id.unwrap_or(Value::Null);

    let reply = match request.method.as_str() {
        "initialize" => result_response(id, handle_initialize(&request.params)),
        "ping" => result_response(id, json!({})),
        "tools/list" => result_response(id, json!({ "tools": tools::list_tools() })),
        "tools/call" => handle_tools_call(state, ctx, id, &request.params).await,
        other => error_response(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };

    RpcReply::Response(reply)
}

fn handle_initialize(params: &Value) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

async fn handle_tools_call(state: &AppState, ctx: &RequestContext, id: Value, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "tools/call requires a 'name' string");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let response = tools::call_tool(state, ctx, name, &arguments).await;

    result_response(
        id,
        json!({
            "content": [{ "type": "text", "text": response.text }],
            "isError": response.is_error
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn state() -> AppState {
        AppState::new(AppConfig::default()).unwrap()
    }

    async fn reply(body: &str) -> RpcReply {
        handle_message(&state(), &RequestContext::default(), body.as_bytes()).await
    }

    fn response(reply: RpcReply) -> Value {
        match reply {
            RpcReply::Response(value) => value,
            RpcReply::Accepted => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn parse_error_for_garbage() {
        let value = response(reply("{not json").await);
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert_eq!(value["id"], Value::Null);
    }

    #[tokio::test]
    async fn notifications_are_accepted() {
        assert_eq!(
            reply(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await,
            RpcReply::Accepted
        );
    }

    #[tokio::test]
    async fn initialize_echoes_protocol_version() {
        let value = response(
            reply(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#).await,
        );
        assert_eq!(value["id"], 1);
        assert_eq!(value["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(value["result"]["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let value = response(reply(r#"{"jsonrpc":"2.0","id":"a","method":"resources/list"}"#).await);
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(value["id"], "a");
    }

    #[tokio::test]
    async fn tools_call_requires_name() {
        let value = response(reply(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{}}"#).await);
        assert_eq!(value["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error_not_rpc_error() {
        let value = response(
            reply(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"b2c","arguments":{}}}"#).await,
        );
        assert_eq!(value["result"]["isError"], true);
        assert_eq!(value["result"]["content"][0]["text"], "Error: Unknown tool 'b2c'");
    }

    #[tokio::test]
    async fn null_id_is_a_request_not_a_notification() {
        let value = response(reply(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).await);
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["result"], json!({}));
    }
}
