//! Index administration tests against a mocked OpenSearch HTTP endpoint.

use std::sync::Arc;

use mockito::Matcher;

use sentrel::client::SearchClient;
use sentrel::config::Settings;
use sentrel::event;
use sentrel::pipeline::Pipeline;

fn client_for(url: &str) -> SearchClient {
    SearchClient::with_url(url, "sentry-events").expect("client")
}

#[tokio::test]
async fn index_template_upsert_targets_the_prefix() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/_index_template/sentry-events-template")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "index_patterns": ["sentry-events-*"],
            "priority": 100,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"acknowledged":true}"#)
        .create_async()
        .await;

    client_for(&server.url())
        .ensure_index_template()
        .await
        .expect("template upsert succeeds");
    mock.assert_async().await;
}

#[tokio::test]
async fn existing_ism_policy_is_left_alone() {
    let mut server = mockito::Server::new_async().await;
    let get_mock = server
        .mock("GET", "/_plugins/_ism/policies/sentry-events-policy")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"policy":{"description":"existing"}}"#)
        .create_async()
        .await;
    let put_mock = server
        .mock("PUT", "/_plugins/_ism/policies/sentry-events-policy")
        .expect(0)
        .create_async()
        .await;

    client_for(&server.url())
        .ensure_ism_policy()
        .await
        .expect("existing policy counts as success");
    get_mock.assert_async().await;
    put_mock.assert_async().await;
}

#[tokio::test]
async fn missing_ism_policy_is_created() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/_plugins/_ism/policies/sentry-events-policy")
        .with_status(404)
        .with_body(r#"{"error":"not found"}"#)
        .create_async()
        .await;
    let put_mock = server
        .mock("PUT", "/_plugins/_ism/policies/sentry-events-policy")
        .match_body(Matcher::Regex(r#""min_index_age":"7d""#.to_string()))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"_id":"sentry-events-policy"}"#)
        .create_async()
        .await;

    client_for(&server.url())
        .ensure_ism_policy()
        .await
        .expect("policy creation succeeds");
    put_mock.assert_async().await;
}

#[tokio::test]
async fn existing_index_is_not_recreated() {
    let mut server = mockito::Server::new_async().await;
    let head_mock = server
        .mock("HEAD", "/sentry-events-2024.01.15")
        .with_status(200)
        .create_async()
        .await;
    let put_mock = server
        .mock("PUT", "/sentry-events-2024.01.15")
        .expect(0)
        .create_async()
        .await;

    client_for(&server.url())
        .create_index_if_missing("sentry-events-2024.01.15")
        .await
        .expect("existing index is fine");
    head_mock.assert_async().await;
    put_mock.assert_async().await;
}

#[tokio::test]
async fn missing_index_is_created_with_the_mapping() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("HEAD", "/sentry-events-2024.01.15")
        .with_status(404)
        .create_async()
        .await;
    let put_mock = server
        .mock("PUT", "/sentry-events-2024.01.15")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "settings": {"number_of_shards": 3}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"acknowledged":true}"#)
        .create_async()
        .await;

    client_for(&server.url())
        .create_index_if_missing("sentry-events-2024.01.15")
        .await
        .expect("index creation succeeds");
    put_mock.assert_async().await;
}

#[tokio::test]
async fn concurrent_index_creation_is_tolerated() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("HEAD", "/sentry-events-2024.01.16")
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("PUT", "/sentry-events-2024.01.16")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"type":"resource_already_exists_exception"}}"#)
        .create_async()
        .await;

    client_for(&server.url())
        .create_index_if_missing("sentry-events-2024.01.16")
        .await
        .expect("already-existing race counts as success");
}

#[tokio::test]
async fn cluster_health_is_parsed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/_cluster/health")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"cluster_name":"test","status":"yellow","number_of_nodes":1}"#)
        .create_async()
        .await;

    let health = client_for(&server.url())
        .cluster_health()
        .await
        .expect("health call succeeds");
    assert_eq!(health["status"], "yellow");
    assert_eq!(health["number_of_nodes"], 1);
}

#[tokio::test]
async fn pipeline_processes_an_event_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/sentry-events-2024.01.15/_doc/e2e1")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "event_id": "e2e1",
            "project_id": 9,
            "message": "ValueError: bad",
            "@timestamp": "2024-01-15T10:00:00+00:00",
            // The raw email never reaches the index, only its hash.
            "user": {"email_hash": "68a9f54521cff965"},
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"_index":"sentry-events-2024.01.15","_id":"e2e1","result":"created"}"#)
        .create_async()
        .await;

    let settings = Settings::default();
    let client = Arc::new(client_for(&server.url()));
    let pipeline = Pipeline::from_settings(&settings, client);

    let raw = event::decode(
        br#"{"event_id":"e2e1","timestamp":1705312800,
            "exception":{"values":[{"type":"ValueError","value":"bad"}]},
            "user":{"email":"alice@example.com"}}"#,
    );
    let outcome = pipeline.process_event(&raw, 9).await.expect("indexed");

    assert_eq!(outcome.index, "sentry-events-2024.01.15");
    mock.assert_async().await;
}
