use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::mpesa_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        // Health
        .route("/health", get(mpesa_health))
        // Outbound gateway calls
        .route("/stk_push", post(mpesa_handlers::initiate_stk_push))
        .route("/check_status", post(mpesa_handlers::check_status))
        .route("/register_c2b_urls", post(mpesa_handlers::register_c2b_urls))
        // Inbound webhook (both STK confirmations and C2B payments)
        .route("/callback", post(mpesa_handlers::mpesa_callback))
        // Reconciliation
        .route(
            "/search_unreconciled_callbacks",
            post(mpesa_handlers::search_unreconciled_callbacks),
        )
        .route("/reconcile_callback", post(mpesa_handlers::reconcile_callback))
        .route(
            "/check_callback_received",
            post(mpesa_handlers::check_callback_received),
        )
}

async fn mpesa_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "mpesa",
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk_push", "c2b", "status_check", "reconciliation"]
    }))
}
