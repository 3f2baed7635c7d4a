// handlers/mpesa_handlers.rs
use axum::body::Bytes;
use axum::extract::{Json, State};
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::models::callback::CallbackEntry;
use crate::services::gateway::MpesaGateway;
use crate::state::AppState;

const DEFAULT_MAX_AGE_MINUTES: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct StkPushApiRequest {
    pub phone_number: String,
    /// JSON number or numeric string; validated before dispatch.
    pub amount: Value,
    pub order_reference: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckStatusRequest {
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchCallbacksRequest {
    pub amount: f64,
    pub max_age_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub callback_id: String,
    pub order_id: String,
}

fn require_gateway(state: &AppState) -> Result<&MpesaGateway> {
    state
        .gateway
        .as_deref()
        .ok_or_else(|| AppError::ServiceUnavailable("M-Pesa gateway is not configured".to_string()))
}

pub async fn initiate_stk_push(
    State(state): State<AppState>,
    Json(request): Json<StkPushApiRequest>,
) -> Result<Json<Value>> {
    info!(
        phone = %request.phone_number,
        order_reference = %request.order_reference,
        "STK push requested"
    );

    let gateway = require_gateway(&state)?;
    let outcome = gateway
        .initiate_stk_push(&request.phone_number, &request.amount, &request.order_reference)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "STK Push sent successfully",
        "checkout_request_id": outcome.checkout_request_id,
        "merchant_request_id": outcome.merchant_request_id,
        "customer_message": outcome.customer_message,
    })))
}

/// Inbound webhook. The provider interprets any non-2xx (or missing ack) as
/// delivery failure and retries, so every outcome is answered with a JSON
/// ack: ResultCode 0 once a record exists, 1 otherwise. The body is read as
/// raw bytes and parsed manually so even malformed or non-UTF-8 payloads get
/// an ack instead of a 400 from the extractor.
pub async fn mpesa_callback(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "callback body is not valid JSON");
            return Json(json!({ "ResultCode": 1, "ResultDesc": "Failed" }));
        }
    };

    match state.ingestor.ingest(&payload).await {
        Ok(report) => {
            info!(
                callback_type = report.callback_type.as_str(),
                reference = %report.reference,
                duplicate = report.duplicate,
                "callback ingested"
            );
            Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
        }
        Err(AppError::UnrecognizedCallback) => {
            warn!("unknown callback format");
            Json(json!({ "ResultCode": 1, "ResultDesc": "Unknown callback format" }))
        }
        Err(err) => {
            error!(error = %err, "callback processing failed");
            Json(json!({ "ResultCode": 1, "ResultDesc": "Failed" }))
        }
    }
}

/// Status poller endpoint. Gateway-level failures are reported in-band as
/// `status: "error"` because the POS front end polls this in a loop.
pub async fn check_status(
    State(state): State<AppState>,
    Json(request): Json<CheckStatusRequest>,
) -> Result<Json<Value>> {
    let gateway = require_gateway(&state)?;
    info!(checkout_request_id = %request.checkout_request_id, "checking payment status");

    match gateway.query_stk_status(&request.checkout_request_id).await {
        Ok(outcome) => Ok(Json(json!({
            "success": outcome.success,
            "status": outcome.status.as_str(),
            "message": outcome.message,
        }))),
        Err(err) => {
            warn!(error = %err, "status query failed");
            Ok(Json(json!({
                "success": false,
                "status": "error",
                "message": err.to_string(),
            })))
        }
    }
}

pub async fn register_c2b_urls(State(state): State<AppState>) -> Result<Json<Value>> {
    let gateway = require_gateway(&state)?;
    let response = gateway.register_c2b_urls().await?;

    Ok(Json(json!({
        "success": true,
        "message": "C2B URLs registered successfully",
        "response": response,
    })))
}

pub async fn search_unreconciled_callbacks(
    State(state): State<AppState>,
    Json(request): Json<SearchCallbacksRequest>,
) -> Result<Json<Value>> {
    let max_age_minutes = request.max_age_minutes.unwrap_or(DEFAULT_MAX_AGE_MINUTES);
    info!(amount = request.amount, max_age_minutes, "searching unreconciled callbacks");

    let candidates = state
        .reconciler
        .find_candidates(request.amount, max_age_minutes)
        .await?;
    let results: Vec<Value> = candidates.iter().map(candidate_summary).collect();

    Ok(Json(json!({
        "success": true,
        "count": results.len(),
        "callbacks": results,
    })))
}

pub async fn reconcile_callback(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<Value>> {
    let callback_id = ObjectId::parse_str(&request.callback_id)?;
    let order_id = ObjectId::parse_str(&request.order_id)?;

    let outcome = state.reconciler.reconcile(callback_id, order_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Callback reconciled successfully",
        "receipt_number": outcome.receipt_number,
    })))
}

pub async fn check_callback_received(
    State(state): State<AppState>,
    Json(request): Json<CheckStatusRequest>,
) -> Result<Json<Value>> {
    let callback = state
        .reconciler
        .has_callback(&request.checkout_request_id)
        .await?;

    match callback {
        Some(entry) => Ok(Json(json!({
            "callback_received": true,
            "callback_id": entry.id.map(|id| id.to_hex()),
            "status": entry.status.as_str(),
            "receipt_number": entry.mpesa_receipt_number,
            "result_desc": entry.result_desc,
            "amount": entry.amount,
        }))),
        None => Ok(Json(json!({ "callback_received": false }))),
    }
}

fn candidate_summary(entry: &CallbackEntry) -> Value {
    json!({
        "id": entry.id.map(|id| id.to_hex()),
        "trans_id": entry.trans_id,
        "mpesa_receipt_number": entry.mpesa_receipt_number,
        "phone_number": entry.phone_number,
        "customer_name": entry.customer_name.as_deref().unwrap_or("Unknown"),
        "amount": entry.amount,
        "transaction_date": entry.transaction_date,
        "create_date": entry.created_at.to_chrono().format("%Y-%m-%d %H:%M:%S").to_string(),
        "bill_ref_number": entry.bill_ref_number.as_deref().unwrap_or(""),
    })
}
