// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Unrecognized callback format")]
    UnrecognizedCallback,

    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("Duplicate key error")]
    DuplicateKey,

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string()),
            AppError::Auth(_) => (StatusCode::BAD_GATEWAY, "Gateway authentication failed".to_string()),
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway request timed out".to_string()),
            AppError::Gateway(_) => (StatusCode::BAD_GATEWAY, "Gateway error".to_string()),
            AppError::Provider(_) => (StatusCode::BAD_GATEWAY, "Provider rejected the request".to_string()),
            AppError::UnrecognizedCallback => (StatusCode::BAD_REQUEST, "Unknown callback format".to_string()),
            AppError::ReconciliationConflict(_) => (StatusCode::CONFLICT, "Reconciliation conflict".to_string()),
            AppError::DuplicateKey => (StatusCode::CONFLICT, "Duplicate entry".to_string()),
            AppError::InvalidObjectId(_) => (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

// Manual From implementations
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout
        } else {
            AppError::Gateway(format!("HTTP request failed: {}", err))
        }
    }
}

impl From<mongodb::bson::oid::Error> for AppError {
    fn from(err: mongodb::bson::oid::Error) -> Self {
        AppError::InvalidObjectId(err.to_string())
    }
}

// Helper conversion functions
impl AppError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::Configuration(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        AppError::Provider(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        AppError::Gateway(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::ReconciliationConflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
