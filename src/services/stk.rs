// src/services/stk.rs
//
// STK push initiation, the status poller and C2B URL registration, all
// running through the MpesaGateway request pipeline.
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::Local;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::services::gateway::MpesaGateway;

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone)]
pub struct StkPushOutcome {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StkStatus {
    Completed,
    Pending,
    Cancelled,
    Failed,
    Error,
}

impl StkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StkStatus::Completed => "completed",
            StkStatus::Pending => "pending",
            StkStatus::Cancelled => "cancelled",
            StkStatus::Failed => "failed",
            StkStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub success: bool,
    pub status: StkStatus,
    pub message: String,
}

/// Known query result codes. New codes are a row here, not new logic.
const RESULT_CODE_TABLE: &[(&str, StkStatus, bool, &str)] = &[
    ("0", StkStatus::Completed, true, "Payment completed successfully"),
    ("1032", StkStatus::Cancelled, false, "Payment cancelled by user"),
    ("1037", StkStatus::Cancelled, false, "Request timed out - customer did not respond"),
    ("1", StkStatus::Failed, false, "Insufficient balance"),
    ("4999", StkStatus::Pending, true, "Transaction still processing"),
    ("1001", StkStatus::Error, false, "Transaction already in progress for this number"),
    ("2001", StkStatus::Failed, false, "Invalid PIN entered"),
    ("1019", StkStatus::Failed, false, "Transaction expired"),
    ("1025", StkStatus::Error, false, "System error - please retry"),
    ("9999", StkStatus::Error, false, "System error - please retry"),
];

/// Normalizes a subscriber number to the `2547XXXXXXXX`/`2541XXXXXXXX`
/// international form the gateway expects.
pub fn normalize_phone(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-'))
        .collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        format!("254{}", rest)
    } else if cleaned.starts_with("254") {
        cleaned
    } else {
        format!("254{}", cleaned)
    }
}

/// The gateway only accepts whole-shilling amounts of at least 1.
pub fn format_amount(raw: &Value) -> Result<i64> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(amount) if amount.is_finite() => Ok((amount.round() as i64).max(1)),
        _ => Err(AppError::validation(format!("Invalid amount: {}", raw))),
    }
}

pub fn generate_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

fn current_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn provider_error_message(body: &Value, fallback: &str) -> String {
    body.get("errorMessage")
        .or_else(|| body.get("ResponseDescription"))
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

/// Maps a stkpushquery response body to a normalized status. Pure function
/// over the body so the full code table is testable offline.
pub fn map_status_response(body: &Value) -> StatusOutcome {
    // Rate limiting arrives as a fault envelope, not a result code.
    if let Some(fault) = body.get("fault") {
        let fault_string = fault
            .get("faultstring")
            .and_then(Value::as_str)
            .unwrap_or("Gateway fault");
        let lowered = fault_string.to_lowercase();
        let message = if lowered.contains("rate") || lowered.contains("spike arrest") {
            "Rate limit - will retry".to_string()
        } else {
            fault_string.to_string()
        };
        return StatusOutcome {
            success: false,
            status: StkStatus::Error,
            message,
        };
    }

    let result_desc = body
        .get("ResultDesc")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string();

    if let Some(code) = value_as_string(body.get("ResultCode")) {
        if let Some((_, status, success, message)) =
            RESULT_CODE_TABLE.iter().find(|(known, ..)| *known == code)
        {
            return StatusOutcome {
                success: *success,
                status: *status,
                message: (*message).to_string(),
            };
        }
        warn!(result_code = %code, result_desc = %result_desc, "unhandled result code");
        return StatusOutcome {
            success: false,
            status: StkStatus::Failed,
            message: result_desc,
        };
    }

    // Accepted but no terminal result code yet.
    if value_as_string(body.get("ResponseCode")).as_deref() == Some("0") {
        return StatusOutcome {
            success: true,
            status: StkStatus::Pending,
            message: "Payment pending".to_string(),
        };
    }

    StatusOutcome {
        success: false,
        status: StkStatus::Failed,
        message: result_desc,
    }
}

impl MpesaGateway {
    /// Sends a push-to-pay prompt to the subscriber's handset. The returned
    /// identifiers correlate the eventual confirmation callback.
    pub async fn initiate_stk_push(
        &self,
        phone_number: &str,
        amount: &Value,
        order_reference: &str,
    ) -> Result<StkPushOutcome> {
        self.config.require_credentials()?;

        // Validate before any network I/O.
        let amount = format_amount(amount)?;
        let phone = normalize_phone(phone_number);

        let timestamp = current_timestamp();
        let password = generate_password(&self.config.shortcode, &self.config.passkey, &timestamp);
        let endpoints = self.config.endpoints();

        let request = StkPushRequest {
            business_short_code: self.config.shortcode.clone(),
            password,
            timestamp,
            transaction_type: self.config.account_type.transaction_type().to_string(),
            amount,
            party_a: phone.clone(),
            party_b: self.config.shortcode.clone(),
            phone_number: phone.clone(),
            callback_url: self.config.callback_url.clone(),
            account_reference: order_reference.to_string(),
            transaction_desc: format!("Payment for {}", order_reference),
        };

        info!(phone = %phone, amount, order_reference, "initiating STK push");
        let payload = serde_json::to_value(&request)?;
        let body = self
            .request(Method::POST, &endpoints.stk_push, Some(&payload))
            .await?;

        if value_as_string(body.get("ResponseCode")).as_deref() == Some("0") {
            let checkout_request_id = body
                .get("CheckoutRequestID")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::gateway("response missing CheckoutRequestID"))?
                .to_string();
            let merchant_request_id = body
                .get("MerchantRequestID")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::gateway("response missing MerchantRequestID"))?
                .to_string();
            info!(%checkout_request_id, "STK push accepted");

            Ok(StkPushOutcome {
                checkout_request_id,
                merchant_request_id,
                customer_message: body
                    .get("CustomerMessage")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        } else {
            let message = provider_error_message(&body, "STK Push failed");
            warn!(%message, "STK push rejected");
            Err(AppError::provider(message))
        }
    }

    /// Polls the gateway for the outcome of a previously initiated push.
    pub async fn query_stk_status(&self, checkout_request_id: &str) -> Result<StatusOutcome> {
        self.config.require_credentials()?;

        let timestamp = current_timestamp();
        let password = generate_password(&self.config.shortcode, &self.config.passkey, &timestamp);
        let endpoints = self.config.endpoints();

        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let body = self
            .request(Method::POST, &endpoints.stk_query, Some(&payload))
            .await?;
        Ok(map_status_response(&body))
    }

    /// Registers the callback URL as both validation and confirmation URL.
    /// Idempotent on the provider side; needed once per shortcode.
    pub async fn register_c2b_urls(&self) -> Result<Value> {
        self.config.require_credentials()?;

        let endpoints = self.config.endpoints();
        let payload = json!({
            "ShortCode": self.config.shortcode,
            "ResponseType": "Completed",
            "ConfirmationURL": self.config.callback_url,
            "ValidationURL": self.config.callback_url,
        });

        info!(callback_url = %self.config.callback_url, "registering C2B URLs");
        let body = self
            .request(Method::POST, &endpoints.c2b_register, Some(&payload))
            .await?;

        // Some gateway versions omit ResponseCode and return only a
        // description on success.
        let response_code = value_as_string(body.get("ResponseCode"));
        if response_code.as_deref() == Some("0")
            || (response_code.is_none() && body.get("ResponseDescription").is_some())
        {
            Ok(body)
        } else {
            Err(AppError::provider(provider_error_message(
                &body,
                "C2B URL registration failed",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountType, Environment, MpesaConfig, TokenFallbackPolicy};
    use crate::services::gateway::{GatewayResponse, GatewayTransport, TransportError};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[test]
    fn phone_forms_normalize_to_one_canonical_number() {
        for input in ["0712345678", "+254712345678", "254712345678", "712345678", "0712 345-678"] {
            assert_eq!(normalize_phone(input), "254712345678", "input: {}", input);
        }
        assert_eq!(normalize_phone("0112345678"), "254112345678");
    }

    #[test]
    fn amounts_round_and_floor_at_one() {
        assert_eq!(format_amount(&json!(100.5)).unwrap(), 101);
        assert_eq!(format_amount(&json!(100.4)).unwrap(), 100);
        assert_eq!(format_amount(&json!(0.2)).unwrap(), 1);
        assert_eq!(format_amount(&json!(-5)).unwrap(), 1);
        assert_eq!(format_amount(&json!("250")).unwrap(), 250);
        assert_eq!(format_amount(&json!(" 99.9 ")).unwrap(), 100);
    }

    #[test]
    fn non_numeric_amount_is_rejected() {
        assert!(matches!(
            format_amount(&json!("abc")),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            format_amount(&Value::Null),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let password = generate_password("174379", "key", "20260823101530");
        assert_eq!(password, base64.encode("174379key20260823101530"));
    }

    #[test]
    fn status_table_maps_known_codes() {
        let cases = [
            ("0", StkStatus::Completed, true),
            ("1032", StkStatus::Cancelled, false),
            ("1037", StkStatus::Cancelled, false),
            ("1", StkStatus::Failed, false),
            ("4999", StkStatus::Pending, true),
            ("1001", StkStatus::Error, false),
            ("2001", StkStatus::Failed, false),
            ("1019", StkStatus::Failed, false),
            ("1025", StkStatus::Error, false),
            ("9999", StkStatus::Error, false),
        ];
        for (code, status, success) in cases {
            let outcome = map_status_response(&json!({
                "ResultCode": code,
                "ResultDesc": "desc",
            }));
            assert_eq!(outcome.status, status, "code {}", code);
            assert_eq!(outcome.success, success, "code {}", code);
        }
    }

    #[test]
    fn unmapped_code_fails_with_provider_description() {
        let outcome = map_status_response(&json!({
            "ResultCode": "7777",
            "ResultDesc": "Something new from the provider",
        }));
        assert_eq!(outcome.status, StkStatus::Failed);
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Something new from the provider");
    }

    #[test]
    fn numeric_result_code_is_tolerated() {
        let outcome = map_status_response(&json!({ "ResultCode": 0 }));
        assert_eq!(outcome.status, StkStatus::Completed);
    }

    #[test]
    fn accepted_without_terminal_code_is_pending() {
        let outcome = map_status_response(&json!({ "ResponseCode": "0" }));
        assert_eq!(outcome.status, StkStatus::Pending);
        assert!(outcome.success);
    }

    #[test]
    fn rate_limit_fault_maps_to_retryable_error() {
        let outcome = map_status_response(&json!({
            "fault": { "faultstring": "Spike arrest violation" },
        }));
        assert_eq!(outcome.status, StkStatus::Error);
        assert_eq!(outcome.message, "Rate limit - will retry");

        let other = map_status_response(&json!({
            "fault": { "faultstring": "Internal routing failure" },
        }));
        assert_eq!(other.status, StkStatus::Error);
        assert_eq!(other.message, "Internal routing failure");
    }

    // Transport fake that records the submitted payload.
    struct RecordingTransport {
        payload: Mutex<Option<Value>>,
        response: Value,
    }

    #[async_trait]
    impl GatewayTransport for RecordingTransport {
        async fn fetch_token(
            &self,
            _url: &str,
            _key: &str,
            _secret: &str,
        ) -> std::result::Result<GatewayResponse, TransportError> {
            Ok(GatewayResponse {
                status: 200,
                body: json!({ "access_token": "tok", "expires_in": "3599" }),
            })
        }

        async fn execute(
            &self,
            _method: reqwest::Method,
            _url: &str,
            _bearer: &str,
            payload: Option<&Value>,
        ) -> std::result::Result<GatewayResponse, TransportError> {
            *self.payload.lock().unwrap() = payload.cloned();
            Ok(GatewayResponse {
                status: 200,
                body: self.response.clone(),
            })
        }
    }

    fn test_gateway(response: Value) -> (MpesaGateway, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport {
            payload: Mutex::new(None),
            response,
        });
        let config = MpesaConfig {
            tenant_id: "174379".to_string(),
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            shortcode: "174379".to_string(),
            passkey: "passkey".to_string(),
            callback_url: "https://pos.example.com/mpesa/callback".to_string(),
            environment: Environment::Sandbox,
            account_type: AccountType::Paybill,
            token_fallback: TokenFallbackPolicy::ReuseCached,
        };
        (MpesaGateway::with_transport(config, transport.clone()), transport)
    }

    #[tokio::test]
    async fn initiate_builds_normalized_payload_and_parses_ids() {
        let (gateway, transport) = test_gateway(json!({
            "ResponseCode": "0",
            "CheckoutRequestID": "ws_CO_123",
            "MerchantRequestID": "mr_456",
            "CustomerMessage": "Success. Request accepted for processing",
        }));

        let outcome = gateway
            .initiate_stk_push("0712345678", &json!(100.5), "ORD-1")
            .await
            .unwrap();

        assert_eq!(outcome.checkout_request_id, "ws_CO_123");
        assert_eq!(outcome.merchant_request_id, "mr_456");
        assert_eq!(
            outcome.customer_message.as_deref(),
            Some("Success. Request accepted for processing")
        );

        let payload = transport.payload.lock().unwrap().clone().unwrap();
        assert_eq!(payload["PhoneNumber"], "254712345678");
        assert_eq!(payload["PartyA"], "254712345678");
        assert_eq!(payload["Amount"], 101);
        assert_eq!(payload["TransactionType"], "CustomerPayBillOnline");
        assert_eq!(payload["AccountReference"], "ORD-1");
        assert_eq!(payload["PartyB"], "174379");
    }

    #[tokio::test]
    async fn initiate_surfaces_provider_rejection() {
        let (gateway, _) = test_gateway(json!({
            "ResponseCode": "1",
            "errorMessage": "Invalid PhoneNumber",
        }));

        let result = gateway
            .initiate_stk_push("0712345678", &json!(10), "ORD-2")
            .await;
        match result {
            Err(AppError::Provider(message)) => assert_eq!(message, "Invalid PhoneNumber"),
            other => panic!("expected provider error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_amount_fails_before_dispatch() {
        let (gateway, transport) = test_gateway(json!({}));
        let result = gateway
            .initiate_stk_push("0712345678", &json!("not-a-number"), "ORD-3")
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(transport.payload.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn register_c2b_urls_sends_callback_url_twice() {
        let (gateway, transport) = test_gateway(json!({
            "ResponseCode": "0",
            "ResponseDescription": "Success",
        }));

        gateway.register_c2b_urls().await.unwrap();

        let payload = transport.payload.lock().unwrap().clone().unwrap();
        assert_eq!(payload["ShortCode"], "174379");
        assert_eq!(payload["ResponseType"], "Completed");
        assert_eq!(payload["ConfirmationURL"], "https://pos.example.com/mpesa/callback");
        assert_eq!(payload["ValidationURL"], "https://pos.example.com/mpesa/callback");
    }
}
