// Integration tests for the ingress endpoints

use axum::http::{Method, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use crate::tests::fixtures::{contact, keyword_draft, webhook_draft};
use crate::tests::helpers::{json_request, read_json, TestHarness};

#[tokio::test]
async fn test_platform_message_runs_matching_automations() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    let automation = h.engine.registry().create(owner, keyword_draft("promo", &["promo"])).await.unwrap();

    let body = json!({
        "type": "message",
        "user_id": owner,
        "from": "+5511999990001",
        "text": { "body": "PROMO please" }
    });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/webhook/whatsapp", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["matched"], json!([automation.id]));
}

#[tokio::test]
async fn test_non_message_events_are_ignored() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.engine.registry().create(owner, keyword_draft("promo", &["promo"])).await.unwrap();

    let body = json!({ "type": "status", "user_id": owner, "from": "+5511999990001" });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/webhook/telegram", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "ignored");
    assert_eq!(ack["matched"], json!([]));
}

#[tokio::test]
async fn test_status_callback_without_sender_is_ignored() {
    let h = TestHarness::new();

    let body = json!({ "type": "status", "status": "delivered", "message_id": "wamid.1" });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/webhook/whatsapp", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ignored");
}

#[tokio::test]
async fn test_message_without_sender_is_bad_request() {
    let h = TestHarness::new();

    let body = json!({ "type": "message", "user_id": Uuid::new_v4(), "text": { "body": "hi" } });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/webhook/whatsapp", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unsupported_platform_is_bad_request() {
    let h = TestHarness::new();

    let body = json!({ "type": "message", "user_id": Uuid::new_v4(), "from": "+1", "text": { "body": "hi" } });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/webhook/myspace", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hook_call_is_accepted() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.contacts.insert(owner, contact(9, "+5511999990009", Some("Caio")));
    let automation = h
        .engine
        .registry()
        .create(owner, webhook_draft("paid", "order-paid", "Thanks {{name}}"))
        .await
        .unwrap();

    let body = json!({ "contact_id": 9, "payload": { "order": { "id": 1 } } });
    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/hooks/order-paid", None, Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(read_json(response).await["matched"], json!([automation.id]));
}

#[tokio::test]
async fn test_unknown_hook_token_is_not_found() {
    let h = TestHarness::new();

    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/hooks/missing", None, Some(json!({ "contact_id": 1 }))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_hook_call_without_contact_is_bad_request() {
    let h = TestHarness::new();
    let owner = Uuid::new_v4();
    h.engine
        .registry()
        .create(owner, webhook_draft("paid", "order-paid", "Thanks"))
        .await
        .unwrap();

    let response = h
        .router()
        .oneshot(json_request(Method::POST, "/api/hooks/order-paid", None, Some(json!({ "payload": {} }))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
