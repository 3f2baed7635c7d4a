// src/store/mod.rs
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;

use crate::errors::Result;
use crate::models::callback::CallbackEntry;
use crate::models::order::{MpesaPaymentDetails, PosOrder};

pub mod memory;
pub mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

/// Persistence boundary for callback entries and the POS order
/// cross-references. Production uses MongoDB; tests use the in-memory store.
#[async_trait]
pub trait CallbackStore: Send + Sync {
    /// Inserts a new callback entry. `AppError::DuplicateKey` when the
    /// uniqueness constraint on `trans_id`/`mpesa_receipt_number` is hit.
    async fn insert_callback(&self, entry: CallbackEntry) -> Result<ObjectId>;

    async fn find_callback(&self, id: ObjectId) -> Result<Option<CallbackEntry>>;

    /// Newest STK entry for a checkout request id, if any.
    async fn find_stk_by_checkout(&self, checkout_request_id: &str)
        -> Result<Option<CallbackEntry>>;

    async fn find_c2b_by_trans_id(&self, trans_id: &str) -> Result<Option<CallbackEntry>>;

    /// Successful, unreconciled C2B entries with an exact amount match
    /// created at or after `since`, newest first.
    async fn find_unreconciled_c2b(&self, amount: f64, since: DateTime)
        -> Result<Vec<CallbackEntry>>;

    /// Compare-and-set `is_reconciled: false -> true`, stamping the order
    /// back-reference and timestamp. Returns false when the entry was
    /// missing or already reconciled.
    async fn mark_reconciled(
        &self,
        callback_id: ObjectId,
        order_id: ObjectId,
        when: DateTime,
    ) -> Result<bool>;

    async fn insert_order(&self, order: PosOrder) -> Result<ObjectId>;

    async fn find_order(&self, id: ObjectId) -> Result<Option<PosOrder>>;

    /// Writes M-Pesa details onto the first payment line of the order whose
    /// payment method name contains `method_substring` (case-insensitive).
    /// Returns false when no payment line matched.
    async fn attach_payment_details(
        &self,
        order_id: ObjectId,
        method_substring: &str,
        details: &MpesaPaymentDetails,
    ) -> Result<bool>;
}
