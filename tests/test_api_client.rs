//! Integration tests for the chat backend REST client
//!
//! Tests behavioral contracts against a mock HTTP server:
//! - Bearer authentication on every request
//! - Token issuance for the broker link
//! - Message, file, typing and presence sends
//! - History paging
//! - Error statuses surfacing as typed errors

use chrono::Utc;
use dtalks_realtime::api::{ChatApi, ChatApiConfig, FileUpload};
use dtalks_realtime::error::ChatError;
use dtalks_realtime::protocol::{MessageType, OutgoingMessage, PresenceUpdate, TypingUpdate};
use dtalks_realtime::transport::TokenProvider;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{
    body_partial_json, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_api(base_url: &str) -> ChatApi {
    ChatApi::new(ChatApiConfig {
        base_url: base_url.to_string(),
        access_token: "user-access-token".to_string(),
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn stored_message(id: &str, content: &str) -> serde_json::Value {
    json!({
        "id": id,
        "chat_id": "42",
        "sender_id": "u1",
        "sender_username": "ada",
        "content": content,
        "message_type": "text",
        "created_at": "2024-06-04T10:15:00.123456",
        "reply_to": null
    })
}

#[tokio::test]
async fn test_fetch_token_returns_broker_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/centrifugo/token"))
        .and(header("Authorization", "Bearer user-access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-abc"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let token = api.fetch_token().await.unwrap();

    assert_eq!(token, "jwt-abc");
}

#[tokio::test]
async fn test_fetch_token_unauthorized_is_token_fetch_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/centrifugo/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let result = api.fetch_token().await;

    assert!(matches!(result, Err(ChatError::TokenFetch { .. })));
}

#[tokio::test]
async fn test_fetch_token_rejects_empty_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/centrifugo/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": ""})))
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    assert!(matches!(
        api.fetch_token().await,
        Err(ChatError::TokenFetch { .. })
    ));
}

#[tokio::test]
async fn test_send_message_returns_stored_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("Authorization", "Bearer user-access-token"))
        .and(body_partial_json(json!({
            "chat_id": "42",
            "content": "hello there",
            "message_type": "text",
            "reply_to": "m0"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(stored_message("m1", "hello there")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let message = OutgoingMessage::text("42", "hello there").replying_to("m0");
    let stored = api.send_message(&message).await.unwrap();

    assert_eq!(stored.id, "m1");
    assert_eq!(stored.content.as_deref(), Some("hello there"));
    assert_eq!(stored.message_type, MessageType::Text);
}

#[tokio::test]
async fn test_send_message_server_error_surfaces_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let result = api.send_message(&OutgoingMessage::text("42", "hi")).await;

    match result {
        Err(ChatError::DownstreamSend { status, message }) => {
            assert_eq!(status, Some(500));
            assert!(message.contains("database unavailable"));
        }
        other => panic!("expected DownstreamSend, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_message_forbidden_surfaces_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let result = api.send_message(&OutgoingMessage::text("42", "hi")).await;

    assert!(matches!(
        result,
        Err(ChatError::DownstreamSend {
            status: Some(403),
            ..
        })
    ));
}

#[tokio::test]
async fn test_send_message_unreachable_backend() {
    // Nothing listens on the discard port
    let api = test_api("http://127.0.0.1:9");
    let result = api.send_message(&OutgoingMessage::text("42", "hi")).await;

    assert!(matches!(
        result,
        Err(ChatError::DownstreamSend { status: None, .. })
    ));
}

#[tokio::test]
async fn test_send_file_uses_multipart_form() {
    let mock_server = MockServer::start().await;

    let mut response = stored_message("m2", "quarterly numbers");
    response["message_type"] = json!("file");
    response["file_name"] = json!("report.pdf");
    response["file_size"] = json!(11);

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("Authorization", "Bearer user-access-token"))
        .and(body_string_contains("report.pdf"))
        .and(body_string_contains("quarterly numbers"))
        .and(body_string_contains("name=\"message_type\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let upload = FileUpload {
        file_name: "report.pdf".to_string(),
        bytes: b"%PDF-1.4 ok".to_vec(),
        caption: Some("quarterly numbers".to_string()),
        reply_to: None,
    };
    let stored = api.send_file_message("42", upload).await.unwrap();

    assert!(stored.is_file());
    assert_eq!(stored.file_name.as_deref(), Some("report.pdf"));
    assert_eq!(stored.file_size, Some(11));
}

#[tokio::test]
async fn test_send_typing_posts_flag() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/typing"))
        .and(body_partial_json(json!({
            "chat_id": "42",
            "user_id": "u1",
            "username": "ada",
            "is_typing": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    api.send_typing(&TypingUpdate {
        chat_id: "42".to_string(),
        user_id: "u1".to_string(),
        username: "ada".to_string(),
        is_typing: true,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_update_online_status_posts_presence() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/online-status"))
        .and(body_partial_json(json!({
            "user_id": "u1",
            "username": "ada",
            "is_online": false
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    api.update_online_status(&PresenceUpdate {
        user_id: "u1".to_string(),
        username: "ada".to_string(),
        is_online: false,
        last_seen: Utc::now(),
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_chat_messages_pages_history() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/42/messages"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            stored_message("m1", "first"),
            stored_message("m2", "second")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let history = api.chat_messages("42", 2, 20).await.unwrap();

    let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_chat_messages_invalid_body_is_downstream_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/42/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&mock_server)
        .await;

    let api = test_api(&mock_server.uri());
    let result = api.chat_messages("42", 1, 50).await;

    assert!(matches!(
        result,
        Err(ChatError::DownstreamSend {
            status: Some(200),
            ..
        })
    ));
}
