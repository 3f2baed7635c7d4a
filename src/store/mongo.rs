// src/store/mongo.rs
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Collection, Database};

use crate::errors::{AppError, Result};
use crate::models::callback::CallbackEntry;
use crate::models::order::{MpesaPaymentDetails, PosOrder};
use crate::store::CallbackStore;

pub const CALLBACKS_COLLECTION: &str = "mpesa_callbacks";
pub const ORDERS_COLLECTION: &str = "pos_orders";

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        MongoStore { db }
    }

    fn callbacks(&self) -> Collection<CallbackEntry> {
        self.db.collection(CALLBACKS_COLLECTION)
    }

    fn orders(&self) -> Collection<PosOrder> {
        self.db.collection(ORDERS_COLLECTION)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

#[async_trait]
impl CallbackStore for MongoStore {
    async fn insert_callback(&self, entry: CallbackEntry) -> Result<ObjectId> {
        let result = self.callbacks().insert_one(&entry).await.map_err(|e| {
            if is_duplicate_key(&e) {
                AppError::DuplicateKey
            } else {
                AppError::MongoDB(e)
            }
        })?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| AppError::gateway("inserted callback id was not an ObjectId"))
    }

    async fn find_callback(&self, id: ObjectId) -> Result<Option<CallbackEntry>> {
        Ok(self.callbacks().find_one(doc! { "_id": id }).await?)
    }

    async fn find_stk_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<CallbackEntry>> {
        Ok(self
            .callbacks()
            .find_one(doc! {
                "callback_type": "stk",
                "checkout_request_id": checkout_request_id,
            })
            .sort(doc! { "created_at": -1 })
            .await?)
    }

    async fn find_c2b_by_trans_id(&self, trans_id: &str) -> Result<Option<CallbackEntry>> {
        Ok(self
            .callbacks()
            .find_one(doc! {
                "callback_type": "c2b",
                "trans_id": trans_id,
            })
            .await?)
    }

    async fn find_unreconciled_c2b(
        &self,
        amount: f64,
        since: DateTime,
    ) -> Result<Vec<CallbackEntry>> {
        let cursor = self
            .callbacks()
            .find(doc! {
                "callback_type": "c2b",
                "status": "success",
                "is_reconciled": false,
                "amount": amount,
                "created_at": { "$gte": since },
            })
            .sort(doc! { "created_at": -1 })
            .await?;

        Ok(cursor.try_collect().await?)
    }

    async fn mark_reconciled(
        &self,
        callback_id: ObjectId,
        order_id: ObjectId,
        when: DateTime,
    ) -> Result<bool> {
        // The is_reconciled guard in the filter makes the transition atomic;
        // a concurrent reconciliation of the same entry matches zero documents.
        let result = self
            .callbacks()
            .update_one(
                doc! { "_id": callback_id, "is_reconciled": false },
                doc! { "$set": {
                    "is_reconciled": true,
                    "pos_order_id": order_id,
                    "reconciled_date": when,
                }},
            )
            .await?;

        Ok(result.matched_count == 1)
    }

    async fn insert_order(&self, order: PosOrder) -> Result<ObjectId> {
        let result = self.orders().insert_one(&order).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| AppError::gateway("inserted order id was not an ObjectId"))
    }

    async fn find_order(&self, id: ObjectId) -> Result<Option<PosOrder>> {
        Ok(self.orders().find_one(doc! { "_id": id }).await?)
    }

    async fn attach_payment_details(
        &self,
        order_id: ObjectId,
        method_substring: &str,
        details: &MpesaPaymentDetails,
    ) -> Result<bool> {
        let result = self
            .orders()
            .update_one(
                doc! {
                    "_id": order_id,
                    "payments": { "$elemMatch": {
                        "payment_method": { "$regex": method_substring, "$options": "i" },
                    }},
                },
                doc! { "$set": {
                    "payments.$.mpesa_receipt_number": details.receipt_number.clone(),
                    "payments.$.mpesa_phone_number": details.phone_number.clone(),
                    "payments.$.mpesa_transaction_date": details.transaction_date.clone(),
                    "payments.$.mpesa_customer_name": details.customer_name.clone(),
                    "payments.$.mpesa_callback_id": details.callback_id,
                }},
            )
            .await?;

        Ok(result.matched_count == 1)
    }
}
