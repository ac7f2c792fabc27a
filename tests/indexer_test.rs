//! Indexer tests against a mocked OpenSearch HTTP endpoint.

use std::sync::Arc;

use mockito::Matcher;

use sentrel::client::SearchClient;
use sentrel::event;
use sentrel::indexer::Indexer;
use sentrel::transform::{IndexedDocument, Transformer};

fn document(event_id: &str, timestamp: i64) -> IndexedDocument {
    let payload = format!(r#"{{"event_id":"{event_id}","timestamp":{timestamp},"message":"m"}}"#);
    Transformer::new().transform(&event::decode(payload.as_bytes()), 1)
}

fn indexer_for(url: &str) -> Indexer {
    let client = SearchClient::with_url(url, "sentry-events").expect("client");
    Indexer::new(Arc::new(client), "sentry-events")
}

// 1705312800 = 2024-01-15T10:00:00Z
const JAN_15: i64 = 1_705_312_800;

#[tokio::test]
async fn index_one_routes_by_timestamp_and_event_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/sentry-events-2024.01.15/_doc/a1b2c3")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"_index":"sentry-events-2024.01.15","_id":"a1b2c3","result":"created"}"#)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let outcome = indexer
        .index_one(&document("a1b2c3", JAN_15))
        .await
        .expect("indexing succeeds");

    assert_eq!(outcome.index, "sentry-events-2024.01.15");
    assert_eq!(outcome.id, "a1b2c3");
    assert_eq!(outcome.result, "created");
    mock.assert_async().await;
}

#[tokio::test]
async fn redelivery_overwrites_the_same_document() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/sentry-events-2024.01.15/_doc/dup1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"_index":"sentry-events-2024.01.15","_id":"dup1","result":"updated"}"#)
        .expect(2)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let doc = document("dup1", JAN_15);
    indexer.index_one(&doc).await.unwrap();
    let second = indexer.index_one(&doc).await.unwrap();

    assert_eq!(second.result, "updated");
    mock.assert_async().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/sentry-events-2024.01.15/_doc/bad1")
        .with_status(400)
        .with_body(r#"{"error":{"type":"mapper_parsing_exception"}}"#)
        .expect(1)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let result = indexer.index_one(&document("bad1", JAN_15)).await;

    assert!(result.is_err());
    mock.assert_async().await;
}

#[tokio::test]
async fn bulk_writes_use_event_id_as_document_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .match_body(Matcher::Regex(r#"(?s)"_id":"dup1".*"_id":"dup1""#.to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"took":5,"errors":false,"items":[{"index":{"_id":"dup1","status":200}},{"index":{"_id":"dup1","status":200}}]}"#,
        )
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let doc = document("dup1", JAN_15);
    let summary = indexer.index_bulk(&[doc.clone(), doc], 500).await;

    assert_eq!(summary.success, 2);
    assert_eq!(summary.failed, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn bulk_chunks_issue_one_request_per_chunk() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"took":1,"errors":false,"items":[]}"#)
        .expect(2)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let docs = vec![
        document("c1", JAN_15),
        document("c2", JAN_15),
        document("c3", JAN_15),
    ];
    let summary = indexer.index_bulk(&docs, 2).await;

    assert_eq!(summary.success, 3);
    assert_eq!(summary.failed, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn bulk_item_errors_are_collected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/_bulk")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"took":3,"errors":true,"items":[
                {"index":{"_id":"ok1","status":200}},
                {"index":{"_id":"bad1","status":400,"error":{"type":"mapper_parsing_exception","reason":"boom"}}}
            ]}"#,
        )
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let docs = vec![document("ok1", JAN_15), document("bad1", JAN_15)];
    let summary = indexer.index_bulk(&docs, 500).await;

    assert_eq!(summary.success, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("mapper_parsing_exception"));
}

#[tokio::test]
async fn failing_chunk_does_not_abort_later_chunks() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(503)
        .with_body("cluster unavailable")
        .expect(2)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let docs = vec![
        document("f1", JAN_15),
        document("f2", JAN_15),
        document("f3", JAN_15),
    ];
    let summary = indexer.index_bulk(&docs, 2).await;

    assert_eq!(summary.success, 0);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.errors.len(), 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn delete_old_skips_fresh_and_malformed_indices() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/sentry-events-.*$".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"sentry-events-2020.01.01":{},"sentry-events-2099.01.01":{},"sentry-events-notadate":{}}"#,
        )
        .create_async()
        .await;
    let delete_mock = server
        .mock("DELETE", "/sentry-events-2020.01.01")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"acknowledged":true}"#)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    let deleted = indexer.delete_old(90).await;

    assert_eq!(deleted, vec!["sentry-events-2020.01.01"]);
    delete_mock.assert_async().await;
}

#[tokio::test]
async fn refresh_targets_the_index_pattern() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Regex(r"^/sentry-events-.*/_refresh$".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"_shards":{"total":1,"successful":1,"failed":0}}"#)
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    indexer.refresh(None).await.expect("refresh succeeds");
    mock.assert_async().await;
}

#[tokio::test]
async fn document_count_degrades_to_zero_on_errors() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/sentry-events-.*/_count$".to_string()))
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let indexer = indexer_for(&server.url());
    assert_eq!(indexer.document_count(None).await, 0);
}
