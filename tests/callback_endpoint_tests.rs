// The webhook contract: the provider treats any non-2xx answer as a delivery
// failure and redelivers, so /callback must ack every request over HTTP with
// an in-band ResultCode instead of an HTTP error.
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pos_mpesa_bridge::routes::mpesa::mpesa_routes;
use pos_mpesa_bridge::state::AppState;
use pos_mpesa_bridge::store::{CallbackStore, InMemoryStore};

fn test_app(store: Arc<InMemoryStore>) -> Router {
    mpesa_routes().with_state(AppState::new(store))
}

async fn post_callback(app: Router, body: Vec<u8>) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/callback")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let ack = serde_json::from_slice(&bytes).unwrap();
    (status, ack)
}

#[tokio::test]
async fn non_utf8_body_gets_a_failure_ack_not_an_http_error() {
    let store = Arc::new(InMemoryStore::new());
    let app = test_app(store);

    let (status, ack) = post_callback(app, vec![0xff, 0xfe, 0x7b, 0x7d]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 1);
}

#[tokio::test]
async fn malformed_json_gets_a_failure_ack() {
    let store = Arc::new(InMemoryStore::new());
    let app = test_app(store);

    let (status, ack) = post_callback(app, b"{\"Body\": ".to_vec()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 1);
}

#[tokio::test]
async fn unknown_shape_gets_a_failure_ack() {
    let store = Arc::new(InMemoryStore::new());
    let app = test_app(store);

    let body = serde_json::to_vec(&json!({ "hello": "world" })).unwrap();
    let (status, ack) = post_callback(app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 1);
    assert_eq!(ack["ResultDesc"], "Unknown callback format");
}

#[tokio::test]
async fn valid_stk_callback_is_acked_and_recorded() {
    let store = Arc::new(InMemoryStore::new());
    let app = test_app(store.clone());

    let payload = json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_HTTP",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 101.0 },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" }
                    ]
                }
            }
        }
    });
    let (status, ack) = post_callback(app, serde_json::to_vec(&payload).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 0);

    let entry = store
        .find_stk_by_checkout("ws_CO_HTTP")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.mpesa_receipt_number.as_deref(), Some("NLJ7RT61SV"));
}

#[tokio::test]
async fn unparsable_c2b_amount_is_acked_as_failure() {
    let store = Arc::new(InMemoryStore::new());
    let app = test_app(store.clone());

    let payload = json!({
        "TransID": "QXA99999",
        "TransTime": "20260823101530",
        "TransAmount": "five hundred",
        "MSISDN": "254712345678",
    });
    let (status, ack) = post_callback(app, serde_json::to_vec(&payload).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 1);
    assert!(store
        .find_c2b_by_trans_id("QXA99999")
        .await
        .unwrap()
        .is_none());
}
