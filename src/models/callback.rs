// src/models/callback.rs
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackType {
    Stk,
    C2b,
}

impl CallbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackType::Stk => "stk",
            CallbackType::C2b => "c2b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Success,
    Failed,
    Cancelled,
    Pending,
}

impl CallbackStatus {
    /// Derived purely from the callback kind and the provider result code.
    /// C2B confirmations are only delivered for completed payments.
    pub fn compute(callback_type: CallbackType, result_code: Option<&str>) -> Self {
        match callback_type {
            CallbackType::C2b => CallbackStatus::Success,
            CallbackType::Stk => match result_code {
                Some("0") => CallbackStatus::Success,
                Some("1032") => CallbackStatus::Cancelled,
                Some("1") | Some("2032") => CallbackStatus::Failed,
                _ => CallbackStatus::Pending,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Success => "success",
            CallbackStatus::Failed => "failed",
            CallbackStatus::Cancelled => "cancelled",
            CallbackStatus::Pending => "pending",
        }
    }
}

/// One persisted record per inbound gateway callback, unifying the STK push
/// confirmation and C2B direct-payment shapes. Immutable after creation
/// except for the reconciliation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEntry {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub callback_type: CallbackType,
    pub status: CallbackStatus,

    // STK push specific
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,

    // C2B specific
    pub trans_id: Option<String>,
    pub customer_name: Option<String>,
    pub bill_ref_number: Option<String>,
    pub transaction_type: Option<String>,

    // Common transaction details
    pub amount: f64,
    pub mpesa_receipt_number: Option<String>,
    /// Provider-formatted free text, e.g. "20260823101530".
    pub transaction_date: Option<String>,
    pub phone_number: Option<String>,

    // Reconciliation
    pub is_reconciled: bool,
    pub pos_order_id: Option<ObjectId>,
    pub reconciled_date: Option<DateTime>,

    pub raw_callback_data: String,
    pub created_at: DateTime,
}
