use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use pos_mpesa_bridge::config::MpesaConfig;
use pos_mpesa_bridge::database::connection::{ensure_indexes, get_db_client};
use pos_mpesa_bridge::routes;
use pos_mpesa_bridge::services::gateway::MpesaGateway;
use pos_mpesa_bridge::state::AppState;
use pos_mpesa_bridge::store::{CallbackStore, MongoStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let db = get_db_client().await?;
    ensure_indexes(&db).await?;

    let store: Arc<dyn CallbackStore> = Arc::new(MongoStore::new(db));
    let app_state = initialize_app_state(store);

    let app = build_router(app_state);
    start_server(app).await
}

fn initialize_app_state(store: Arc<dyn CallbackStore>) -> AppState {
    let app_state = AppState::new(store);

    match MpesaConfig::from_env() {
        Ok(config) => {
            tracing::info!(
                shortcode = %config.shortcode,
                environment = ?config.environment,
                account_type = ?config.account_type,
                "M-Pesa gateway configured"
            );
            app_state.with_gateway(Arc::new(MpesaGateway::new(config)))
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to load M-Pesa configuration");
            tracing::warn!("gateway calls disabled; callback ingestion and reconciliation remain available");
            app_state
        }
    }
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .nest("/mpesa", routes::mpesa::mpesa_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn start_server(app: Router) -> anyhow::Result<()> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(8080)));

    tracing::info!(%addr, "server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
