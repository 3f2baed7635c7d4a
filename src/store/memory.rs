// src/store/memory.rs
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;

use crate::errors::{AppError, Result};
use crate::models::callback::{CallbackEntry, CallbackStatus, CallbackType};
use crate::models::order::{MpesaPaymentDetails, PosOrder};
use crate::store::CallbackStore;

/// Callback store backed by process memory. Enforces the same uniqueness
/// rules as the Mongo indexes so the ingestor's duplicate handling can be
/// exercised without a database.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    callbacks: Vec<CallbackEntry>,
    orders: HashMap<ObjectId, PosOrder>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallbackStore for InMemoryStore {
    async fn insert_callback(&self, mut entry: CallbackEntry) -> Result<ObjectId> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let duplicate = inner.callbacks.iter().any(|existing| {
            let same_trans = entry.trans_id.is_some() && existing.trans_id == entry.trans_id;
            let same_receipt = entry.mpesa_receipt_number.is_some()
                && existing.mpesa_receipt_number == entry.mpesa_receipt_number;
            same_trans || same_receipt
        });
        if duplicate {
            return Err(AppError::DuplicateKey);
        }

        let id = ObjectId::new();
        entry.id = Some(id);
        inner.callbacks.push(entry);
        Ok(id)
    }

    async fn find_callback(&self, id: ObjectId) -> Result<Option<CallbackEntry>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.callbacks.iter().find(|c| c.id == Some(id)).cloned())
    }

    async fn find_stk_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<CallbackEntry>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut matches: Vec<&CallbackEntry> = inner
            .callbacks
            .iter()
            .filter(|c| {
                c.callback_type == CallbackType::Stk
                    && c.checkout_request_id.as_deref() == Some(checkout_request_id)
            })
            .collect();
        matches.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(matches.first().map(|c| (*c).clone()))
    }

    async fn find_c2b_by_trans_id(&self, trans_id: &str) -> Result<Option<CallbackEntry>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .callbacks
            .iter()
            .find(|c| {
                c.callback_type == CallbackType::C2b && c.trans_id.as_deref() == Some(trans_id)
            })
            .cloned())
    }

    async fn find_unreconciled_c2b(
        &self,
        amount: f64,
        since: DateTime,
    ) -> Result<Vec<CallbackEntry>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut matches: Vec<CallbackEntry> = inner
            .callbacks
            .iter()
            .filter(|c| {
                c.callback_type == CallbackType::C2b
                    && c.status == CallbackStatus::Success
                    && !c.is_reconciled
                    && c.amount == amount
                    && c.created_at >= since
            })
            .cloned()
            .collect();
        matches.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(matches)
    }

    async fn mark_reconciled(
        &self,
        callback_id: ObjectId,
        order_id: ObjectId,
        when: DateTime,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let entry = inner
            .callbacks
            .iter_mut()
            .find(|c| c.id == Some(callback_id) && !c.is_reconciled);

        match entry {
            Some(entry) => {
                entry.is_reconciled = true;
                entry.pos_order_id = Some(order_id);
                entry.reconciled_date = Some(when);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_order(&self, mut order: PosOrder) -> Result<ObjectId> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let id = ObjectId::new();
        order.id = Some(id);
        inner.orders.insert(id, order);
        Ok(id)
    }

    async fn find_order(&self, id: ObjectId) -> Result<Option<PosOrder>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.orders.get(&id).cloned())
    }

    async fn attach_payment_details(
        &self,
        order_id: ObjectId,
        method_substring: &str,
        details: &MpesaPaymentDetails,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let needle = method_substring.to_lowercase();

        let Some(order) = inner.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        let Some(payment) = order
            .payments
            .iter_mut()
            .find(|p| p.payment_method.to_lowercase().contains(&needle))
        else {
            return Ok(false);
        };

        payment.mpesa_receipt_number = details.receipt_number.clone();
        payment.mpesa_phone_number = details.phone_number.clone();
        payment.mpesa_transaction_date = details.transaction_date.clone();
        payment.mpesa_customer_name = details.customer_name.clone();
        payment.mpesa_callback_id = Some(details.callback_id);
        Ok(true)
    }
}
