// src/models/order.rs
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// POS order as seen by this service. The order lifecycle itself is owned by
/// the point-of-sale; we only read it and annotate its payment lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosOrder {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub reference: String,
    pub payments: Vec<OrderPayment>,
    pub created_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayment {
    pub payment_method: String,
    pub amount: f64,

    // M-Pesa cross-references, written during reconciliation so receipts can
    // be displayed without a join at read time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_receipt_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_transaction_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_callback_id: Option<ObjectId>,
}

impl OrderPayment {
    pub fn new(payment_method: impl Into<String>, amount: f64) -> Self {
        OrderPayment {
            payment_method: payment_method.into(),
            amount,
            mpesa_receipt_number: None,
            mpesa_phone_number: None,
            mpesa_customer_name: None,
            mpesa_transaction_date: None,
            mpesa_callback_id: None,
        }
    }
}

/// Values projected from a reconciled callback onto an order payment line.
#[derive(Debug, Clone)]
pub struct MpesaPaymentDetails {
    pub receipt_number: Option<String>,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
    pub customer_name: Option<String>,
    pub callback_id: ObjectId,
}
