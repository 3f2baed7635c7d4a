// src/database/connection.rs
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use tracing::info;

use crate::errors::Result;
use crate::models::callback::CallbackEntry;
use crate::store::mongo::CALLBACKS_COLLECTION;

const DB_NAME: &str = "pos_mpesa";

pub async fn get_db_client() -> Result<Database> {
    let database_url = std::env::var("DATABASE_URL").map_err(|_| {
        crate::errors::AppError::configuration("DATABASE_URL must be set as an environment variable")
    })?;

    let client = Client::with_uri_str(&database_url).await?;
    let db = client.database(DB_NAME);

    db.run_command(doc! { "ping": 1 }).await?;
    info!(database = DB_NAME, "connected to MongoDB");

    Ok(db)
}

/// One callback entry per real-world transaction: `trans_id` and
/// `mpesa_receipt_number` are unique when present (sparse), and the lookup
/// paths used by polling and reconciliation are indexed.
pub async fn ensure_indexes(db: &Database) -> Result<()> {
    let callbacks = db.collection::<CallbackEntry>(CALLBACKS_COLLECTION);

    let unique_sparse = IndexOptions::builder().unique(true).sparse(true).build();
    let indexes = vec![
        IndexModel::builder()
            .keys(doc! { "trans_id": 1 })
            .options(unique_sparse.clone())
            .build(),
        IndexModel::builder()
            .keys(doc! { "mpesa_receipt_number": 1 })
            .options(unique_sparse)
            .build(),
        IndexModel::builder()
            .keys(doc! { "callback_type": 1, "checkout_request_id": 1 })
            .build(),
        IndexModel::builder()
            .keys(doc! { "callback_type": 1, "status": 1, "is_reconciled": 1, "amount": 1 })
            .build(),
        IndexModel::builder()
            .keys(doc! { "created_at": -1 })
            .build(),
        IndexModel::builder()
            .keys(doc! { "phone_number": 1 })
            .build(),
    ];

    callbacks.create_indexes(indexes).await?;
    info!("callback indexes ensured");
    Ok(())
}
