use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::mcp_handlers;
use crate::mcp::tools::STK_PUSH_TOOL;
use crate::state::AppState;

pub fn mcp_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(mpesa_health))
        .route("/mcp", post(mcp_handlers::handle_mcp))
}

async fn mpesa_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "mpesa",
        "timestamp": Utc::now().to_rfc3339(),
        "tools": [STK_PUSH_TOOL],
        "config": state.config.get_config_info(),
    }))
}
