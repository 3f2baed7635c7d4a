// src/services/reconciliation.rs
use std::sync::Arc;

use chrono::{Duration, Utc};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::DateTime;
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::models::callback::{CallbackEntry, CallbackType};
use crate::models::order::MpesaPaymentDetails;
use crate::store::CallbackStore;

/// Case-insensitive substring identifying the gateway's payment method on a
/// POS order payment line.
pub const PAYMENT_METHOD_MARKER: &str = "mpesa";

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub receipt_number: Option<String>,
    /// False when the order carried no matching payment line; the callback
    /// is still reconciled in that case.
    pub payment_updated: bool,
}

/// Links confirmed callbacks to POS orders and their payment lines.
pub struct Reconciler {
    store: Arc<dyn CallbackStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CallbackStore>) -> Self {
        Reconciler { store }
    }

    /// Unreconciled successful direct payments matching `amount` created
    /// within the trailing window, newest first.
    pub async fn find_candidates(
        &self,
        amount: f64,
        max_age_minutes: i64,
    ) -> Result<Vec<CallbackEntry>> {
        let since = DateTime::from_chrono(Utc::now() - Duration::minutes(max_age_minutes));
        self.store.find_unreconciled_c2b(amount, since).await
    }

    pub async fn reconcile(
        &self,
        callback_id: ObjectId,
        order_id: ObjectId,
    ) -> Result<ReconcileOutcome> {
        let callback = self
            .store
            .find_callback(callback_id)
            .await?
            .ok_or_else(|| AppError::conflict("Callback not found"))?;
        if callback.is_reconciled {
            return Err(AppError::conflict("Callback already reconciled"));
        }

        self.store
            .find_order(order_id)
            .await?
            .ok_or_else(|| AppError::conflict("Order not found"))?;

        // Claim the callback first; losing the race here means another
        // reconciliation already owns it.
        let claimed = self
            .store
            .mark_reconciled(callback_id, order_id, DateTime::now())
            .await?;
        if !claimed {
            return Err(AppError::conflict("Callback already reconciled"));
        }

        let details = MpesaPaymentDetails {
            receipt_number: callback.mpesa_receipt_number.clone(),
            phone_number: callback.phone_number.clone(),
            transaction_date: callback.transaction_date.clone(),
            // STK callbacks carry no customer name.
            customer_name: match callback.callback_type {
                CallbackType::C2b => callback.customer_name.clone(),
                CallbackType::Stk => None,
            },
            callback_id,
        };

        let payment_updated = self
            .store
            .attach_payment_details(order_id, PAYMENT_METHOD_MARKER, &details)
            .await?;
        if payment_updated {
            info!(
                %callback_id,
                %order_id,
                receipt = callback.mpesa_receipt_number.as_deref().unwrap_or(""),
                "payment line updated with callback details"
            );
        } else {
            warn!(%order_id, "no M-Pesa payment line found on order to update");
        }

        info!(
            callback_type = callback.callback_type.as_str(),
            %callback_id,
            %order_id,
            amount = callback.amount,
            "callback reconciled"
        );

        Ok(ReconcileOutcome {
            receipt_number: callback.mpesa_receipt_number,
            payment_updated,
        })
    }

    /// Newest push confirmation for a checkout request, letting the POS skip
    /// a provider status query once the callback has already landed.
    pub async fn has_callback(&self, checkout_request_id: &str) -> Result<Option<CallbackEntry>> {
        self.store.find_stk_by_checkout(checkout_request_id).await
    }
}
