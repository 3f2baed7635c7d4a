// src/services/callbacks.rs
//
// Inbound webhook handling: structural classification of the two callback
// shapes the gateway delivers, and ingestion into the callback store.
use std::sync::Arc;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::models::callback::{CallbackEntry, CallbackStatus, CallbackType};
use crate::store::CallbackStore;

// ----- wire shapes -----

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallbackPayload,
}

#[derive(Debug, Deserialize)]
struct StkCallbackPayload {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode", default)]
    result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Value", default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct C2bPayload {
    #[serde(rename = "TransID")]
    trans_id: String,
    #[serde(rename = "TransactionType", default)]
    transaction_type: Option<String>,
    #[serde(rename = "TransTime", default)]
    trans_time: Value,
    #[serde(rename = "TransAmount", default)]
    trans_amount: Value,
    #[serde(rename = "BillRefNumber", default)]
    bill_ref_number: Option<String>,
    #[serde(rename = "MSISDN", default)]
    msisdn: Value,
    #[serde(rename = "FirstName", default)]
    first_name: Option<String>,
    #[serde(rename = "MiddleName", default)]
    middle_name: Option<String>,
    #[serde(rename = "LastName", default)]
    last_name: Option<String>,
}

// ----- classified shapes -----

/// Push-confirmation callback, delivered after an STK push concludes.
#[derive(Debug, Clone)]
pub struct StkConfirmation {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub amount: Option<f64>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<String>,
    pub phone_number: Option<String>,
}

/// Direct-payment (C2B) callback; only delivered for completed payments.
#[derive(Debug, Clone)]
pub struct DirectPayment {
    pub trans_id: String,
    pub transaction_type: Option<String>,
    pub transaction_date: Option<String>,
    pub amount: f64,
    pub bill_ref_number: Option<String>,
    pub phone_number: Option<String>,
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CallbackKind {
    StkConfirmation(StkConfirmation),
    DirectPayment(DirectPayment),
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Determines the callback shape structurally: a nested `Body.stkCallback`
/// object marks a push confirmation, a top-level `TransID` a direct payment.
pub fn classify(raw: &Value) -> Result<CallbackKind> {
    if raw
        .get("Body")
        .and_then(|body| body.get("stkCallback"))
        .is_some()
    {
        let envelope: StkCallbackEnvelope = serde_json::from_value(raw.clone())
            .map_err(|_| AppError::UnrecognizedCallback)?;
        return Ok(CallbackKind::StkConfirmation(project_stk(
            envelope.body.stk_callback,
        )));
    }

    if raw.get("TransID").is_some() {
        let payload: C2bPayload =
            serde_json::from_value(raw.clone()).map_err(|_| AppError::UnrecognizedCallback)?;
        return Ok(CallbackKind::DirectPayment(project_c2b(payload)?));
    }

    Err(AppError::UnrecognizedCallback)
}

fn project_stk(payload: StkCallbackPayload) -> StkConfirmation {
    let mut confirmation = StkConfirmation {
        merchant_request_id: payload.merchant_request_id,
        checkout_request_id: payload.checkout_request_id,
        result_code: value_as_string(&payload.result_code),
        result_desc: payload.result_desc,
        amount: None,
        receipt_number: None,
        transaction_date: None,
        phone_number: None,
    };

    let items = payload
        .callback_metadata
        .map(|metadata| metadata.items)
        .unwrap_or_default();
    for item in items {
        match item.name.as_str() {
            "Amount" => confirmation.amount = value_as_f64(&item.value),
            "MpesaReceiptNumber" => confirmation.receipt_number = value_as_string(&item.value),
            "TransactionDate" => confirmation.transaction_date = value_as_string(&item.value),
            "PhoneNumber" => confirmation.phone_number = value_as_string(&item.value),
            // Unknown item names are ignored.
            _ => {}
        }
    }

    confirmation
}

fn project_c2b(payload: C2bPayload) -> Result<DirectPayment> {
    // An unparsable amount must fail the delivery rather than persist an
    // immutable success record that can never reconcile.
    let amount = match &payload.trans_amount {
        Value::Null => 0.0,
        value => value_as_f64(value).ok_or_else(|| {
            AppError::validation(format!("Invalid TransAmount: {}", value))
        })?,
    };

    let name_parts = [
        payload.first_name.as_deref(),
        payload.middle_name.as_deref(),
        payload.last_name.as_deref(),
    ];
    let customer_name = name_parts
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(DirectPayment {
        trans_id: payload.trans_id,
        transaction_type: payload.transaction_type,
        transaction_date: value_as_string(&payload.trans_time),
        amount,
        bill_ref_number: payload.bill_ref_number,
        phone_number: value_as_string(&payload.msisdn),
        customer_name: if customer_name.is_empty() {
            None
        } else {
            Some(customer_name)
        },
    })
}

// ----- ingestion -----

#[derive(Debug)]
pub struct IngestReport {
    pub callback_type: CallbackType,
    pub callback_id: Option<ObjectId>,
    pub duplicate: bool,
    /// Checkout request id (stk) or transaction id (c2b), for logging.
    pub reference: String,
}

/// Persists classified callbacks exactly once. Webhook providers redeliver
/// until acknowledged, so duplicates are detected before insertion and also
/// absorbed when the storage uniqueness constraint fires first.
pub struct CallbackIngestor {
    store: Arc<dyn CallbackStore>,
}

impl CallbackIngestor {
    pub fn new(store: Arc<dyn CallbackStore>) -> Self {
        CallbackIngestor { store }
    }

    pub async fn ingest(&self, raw: &Value) -> Result<IngestReport> {
        let kind = classify(raw)?;
        let raw_text = serde_json::to_string(raw)?;

        match kind {
            CallbackKind::StkConfirmation(confirmation) => {
                self.ingest_stk(confirmation, raw_text).await
            }
            CallbackKind::DirectPayment(payment) => self.ingest_c2b(payment, raw_text).await,
        }
    }

    async fn ingest_stk(
        &self,
        confirmation: StkConfirmation,
        raw_text: String,
    ) -> Result<IngestReport> {
        let reference = confirmation
            .checkout_request_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        // One terminal confirmation per checkout request.
        if let Some(checkout_request_id) = &confirmation.checkout_request_id {
            if let Some(existing) = self.store.find_stk_by_checkout(checkout_request_id).await? {
                info!(%checkout_request_id, "duplicate STK callback delivery ignored");
                return Ok(IngestReport {
                    callback_type: CallbackType::Stk,
                    callback_id: existing.id,
                    duplicate: true,
                    reference,
                });
            }
        }

        let status =
            CallbackStatus::compute(CallbackType::Stk, confirmation.result_code.as_deref());
        let entry = CallbackEntry {
            id: None,
            callback_type: CallbackType::Stk,
            status,
            merchant_request_id: confirmation.merchant_request_id,
            checkout_request_id: confirmation.checkout_request_id,
            result_code: confirmation.result_code,
            result_desc: confirmation.result_desc,
            trans_id: None,
            customer_name: None,
            bill_ref_number: None,
            transaction_type: None,
            amount: confirmation.amount.unwrap_or(0.0),
            mpesa_receipt_number: confirmation.receipt_number,
            transaction_date: confirmation.transaction_date,
            phone_number: confirmation.phone_number,
            is_reconciled: false,
            pos_order_id: None,
            reconciled_date: None,
            raw_callback_data: raw_text,
            created_at: DateTime::now(),
        };

        self.insert(entry, CallbackType::Stk, reference).await
    }

    async fn ingest_c2b(&self, payment: DirectPayment, raw_text: String) -> Result<IngestReport> {
        let reference = payment.trans_id.clone();

        if let Some(existing) = self.store.find_c2b_by_trans_id(&payment.trans_id).await? {
            info!(trans_id = %payment.trans_id, "duplicate C2B callback delivery ignored");
            return Ok(IngestReport {
                callback_type: CallbackType::C2b,
                callback_id: existing.id,
                duplicate: true,
                reference,
            });
        }

        let entry = CallbackEntry {
            id: None,
            callback_type: CallbackType::C2b,
            status: CallbackStatus::compute(CallbackType::C2b, None),
            merchant_request_id: None,
            checkout_request_id: None,
            result_code: None,
            result_desc: None,
            trans_id: Some(payment.trans_id.clone()),
            customer_name: payment.customer_name,
            bill_ref_number: payment.bill_ref_number,
            transaction_type: payment.transaction_type,
            amount: payment.amount,
            // C2B uses the transaction id as the receipt number.
            mpesa_receipt_number: Some(payment.trans_id),
            transaction_date: payment.transaction_date,
            phone_number: payment.phone_number,
            is_reconciled: false,
            pos_order_id: None,
            reconciled_date: None,
            raw_callback_data: raw_text,
            created_at: DateTime::now(),
        };

        self.insert(entry, CallbackType::C2b, reference).await
    }

    async fn insert(
        &self,
        entry: CallbackEntry,
        callback_type: CallbackType,
        reference: String,
    ) -> Result<IngestReport> {
        match self.store.insert_callback(entry).await {
            Ok(id) => {
                info!(
                    callback_type = callback_type.as_str(),
                    %reference,
                    "callback entry created"
                );
                Ok(IngestReport {
                    callback_type,
                    callback_id: Some(id),
                    duplicate: false,
                    reference,
                })
            }
            // Concurrent redelivery raced past the pre-insert check.
            Err(AppError::DuplicateKey) => {
                warn!(
                    callback_type = callback_type.as_str(),
                    %reference,
                    "duplicate callback rejected by storage constraint"
                );
                Ok(IngestReport {
                    callback_type,
                    callback_id: None,
                    duplicate: true,
                    reference,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn stk_payload(checkout: &str, result_code: i64) -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": checkout,
                    "ResultCode": result_code,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 101.0 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "Balance" },
                            { "Name": "TransactionDate", "Value": 20260823101530_i64 },
                            { "Name": "PhoneNumber", "Value": 254712345678_i64 }
                        ]
                    }
                }
            }
        })
    }

    fn c2b_payload(trans_id: &str) -> Value {
        json!({
            "TransactionType": "Pay Bill",
            "TransID": trans_id,
            "TransTime": "20260823101530",
            "TransAmount": "500.00",
            "BusinessShortCode": "174379",
            "BillRefNumber": "ORD-9",
            "MSISDN": "254712345678",
            "FirstName": "JANE",
            "MiddleName": "",
            "LastName": "DOE"
        })
    }

    #[test]
    fn nested_stk_callback_classifies_as_push_confirmation() {
        let kind = classify(&stk_payload("ws_CO_1", 0)).unwrap();
        match kind {
            CallbackKind::StkConfirmation(stk) => {
                assert_eq!(stk.checkout_request_id.as_deref(), Some("ws_CO_1"));
                assert_eq!(stk.result_code.as_deref(), Some("0"));
                assert_eq!(stk.amount, Some(101.0));
                assert_eq!(stk.receipt_number.as_deref(), Some("NLJ7RT61SV"));
                assert_eq!(stk.transaction_date.as_deref(), Some("20260823101530"));
                assert_eq!(stk.phone_number.as_deref(), Some("254712345678"));
            }
            other => panic!("expected stk confirmation, got {:?}", other),
        }
    }

    #[test]
    fn top_level_trans_id_classifies_as_direct_payment() {
        let kind = classify(&c2b_payload("NLJ7RT61SV")).unwrap();
        match kind {
            CallbackKind::DirectPayment(payment) => {
                assert_eq!(payment.trans_id, "NLJ7RT61SV");
                assert_eq!(payment.amount, 500.0);
                // Empty middle name skipped when joining.
                assert_eq!(payment.customer_name.as_deref(), Some("JANE DOE"));
                assert_eq!(payment.bill_ref_number.as_deref(), Some("ORD-9"));
            }
            other => panic!("expected direct payment, got {:?}", other),
        }
    }

    #[test]
    fn unparsable_c2b_amount_fails_the_delivery() {
        let mut payload = c2b_payload("QXA77777");
        payload["TransAmount"] = json!("five hundred");
        assert!(matches!(
            classify(&payload),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unparsable_c2b_amount_stores_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = CallbackIngestor::new(store.clone());

        let mut payload = c2b_payload("QXA88888");
        payload["TransAmount"] = json!("n/a");
        assert!(ingestor.ingest(&payload).await.is_err());

        // Redelivery with a corrected amount goes through.
        let report = ingestor.ingest(&c2b_payload("QXA88888")).await.unwrap();
        assert!(!report.duplicate);
    }

    #[test]
    fn unrecognized_shape_is_rejected() {
        let result = classify(&json!({ "hello": "world" }));
        assert!(matches!(result, Err(AppError::UnrecognizedCallback)));

        // A Body without stkCallback is equally unrecognized.
        let result = classify(&json!({ "Body": { "other": {} } }));
        assert!(matches!(result, Err(AppError::UnrecognizedCallback)));
    }

    #[test]
    fn failed_push_has_no_metadata_and_still_classifies() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_2",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });
        match classify(&payload).unwrap() {
            CallbackKind::StkConfirmation(stk) => {
                assert_eq!(stk.result_code.as_deref(), Some("1032"));
                assert_eq!(stk.receipt_number, None);
                assert_eq!(stk.amount, None);
            }
            other => panic!("expected stk confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ingest_creates_entry_once_and_dedupes_redelivery() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = CallbackIngestor::new(store.clone());

        let first = ingestor.ingest(&stk_payload("ws_CO_3", 0)).await.unwrap();
        assert!(!first.duplicate);
        let id = first.callback_id.unwrap();

        let entry = store.find_callback(id).await.unwrap().unwrap();
        assert_eq!(entry.callback_type, CallbackType::Stk);
        assert_eq!(entry.status, crate::models::callback::CallbackStatus::Success);
        assert_eq!(entry.amount, 101.0);
        assert!(!entry.is_reconciled);

        let second = ingestor.ingest(&stk_payload("ws_CO_3", 0)).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.callback_id, Some(id));
    }

    #[tokio::test]
    async fn ingest_c2b_uses_trans_id_as_receipt() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = CallbackIngestor::new(store.clone());

        let report = ingestor.ingest(&c2b_payload("QBC1XYZ9")).await.unwrap();
        let entry = store
            .find_callback(report.callback_id.unwrap())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.callback_type, CallbackType::C2b);
        assert_eq!(entry.mpesa_receipt_number.as_deref(), Some("QBC1XYZ9"));
        assert_eq!(entry.status, crate::models::callback::CallbackStatus::Success);

        let duplicate = ingestor.ingest(&c2b_payload("QBC1XYZ9")).await.unwrap();
        assert!(duplicate.duplicate);
    }
}
