use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tsk_reconcile::{fields_from_json, normalize_list, normalize_record, CorrelationToken};
use tsk_transport::{HttpMutationTransport, MutationTransport, TransportError};

fn transport(server: &MockServer) -> HttpMutationTransport {
    HttpMutationTransport::new(server.base_url(), Some("tok-123"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn scenario_create_sends_bearer_and_correlation_token() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/tasks")
                .header("authorization", "Bearer tok-123")
                .header("x-correlation-token", "T1")
                .json_body(json!({"title": "Buy milk", "correlationToken": "T1"}));
            then.status(201)
                .json_body(json!({"task": {"_id": "srv-42", "title": "Buy milk", "completed": false}}));
        })
        .await;

    let resp = transport(&server)
        .submit_create(
            &CorrelationToken::new("T1"),
            &fields_from_json(json!({"title": "Buy milk"})),
        )
        .await
        .unwrap();
    m.assert_async().await;

    let rec = normalize_record(&resp).unwrap();
    assert_eq!(rec.identity, "srv-42");
}

#[tokio::test]
async fn scenario_non_success_maps_to_rejected_with_server_message() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/api/tasks/srv-7");
            then.status(404).json_body(json!({"message": "Task not found"}));
        })
        .await;

    let err = transport(&server)
        .submit_update("srv-7", &fields_from_json(json!({"completed": true})))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TransportError::Rejected {
            status: Some(404),
            message: "Task not found".to_string()
        }
    );
}

#[tokio::test]
async fn scenario_delete_with_empty_body_succeeds() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api/tasks/srv-5");
            then.status(204);
        })
        .await;

    transport(&server).submit_delete("srv-5").await.unwrap();
    m.assert_async().await;
}

#[tokio::test]
async fn scenario_fetch_all_returns_list_envelope() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tasks");
            then.status(200).json_body(json!({"tasks": [
                {"_id": "srv-1", "title": "a"},
                {"id": 2, "title": "b", "completed": true},
            ]}));
        })
        .await;

    let body = transport(&server).fetch_all().await.unwrap();
    let ids: Vec<String> = normalize_list(&body).map(|r| r.unwrap().identity).collect();
    assert_eq!(ids, vec!["srv-1", "2"]);
}

#[tokio::test]
async fn scenario_slow_server_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tasks");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(json!([]));
        })
        .await;

    let t = HttpMutationTransport::new(server.base_url(), None, Duration::from_millis(50)).unwrap();
    let err = t.fetch_all().await.unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn scenario_undecodable_body_is_decode_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tasks");
            then.status(200).body("<html>oops</html>");
        })
        .await;

    let err = transport(&server).fetch_all().await.unwrap_err();
    assert!(matches!(err, TransportError::Decode(_)));
}
