//! Control-plane and HTTP imposter integration tests.

mod support;

use serde_json::{json, Value};
use std::time::Instant;
use support::{client, control_url, start_control_plane};

#[tokio::test]
async fn test_create_record_and_inspect() {
    let control = 2601;
    start_control_plane(control).await;
    let client = client();

    let created = client
        .post(control_url(control, "/imposters"))
        .json(&json!({"protocol": "http", "port": 5100, "recordRequests": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    assert!(created.headers().get("location").is_some());

    client
        .get("http://127.0.0.1:5100/first")
        .send()
        .await
        .unwrap();
    client
        .get("http://127.0.0.1:5100/second")
        .send()
        .await
        .unwrap();

    let view: Value = client
        .get(control_url(control, "/imposters/5100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let paths: Vec<&str> = view["requests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["/first", "/second"]);
    assert_eq!(view["numberOfRequests"], json!(2));
}

#[tokio::test]
async fn test_stub_links_enumerate_indexes() {
    let control = 2602;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5101,
            "stubs": [
                {"responses": [{"is": {"body": "1"}}]},
                {"responses": [{"is": {"body": "2"}}]}
            ]
        }))
        .send()
        .await
        .unwrap();

    let view: Value = client
        .get(control_url(control, "/imposters/5101"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stubs = view["stubs"].as_array().unwrap();
    assert_eq!(stubs.len(), 2);
    assert!(stubs[0]["_links"]["self"]["href"]
        .as_str()
        .unwrap()
        .ends_with("/stubs/0"));
    assert!(stubs[1]["_links"]["self"]["href"]
        .as_str()
        .unwrap()
        .ends_with("/stubs/1"));
}

#[tokio::test]
async fn test_response_cycling_round_trip() {
    let control = 2603;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 4548,
            "stubs": [{"responses": [
                {"is": {"body": "first"}},
                {"is": {"body": "second"}},
                {"is": {"body": "third"}}
            ]}]
        }))
        .send()
        .await
        .unwrap();

    let mut bodies = Vec::new();
    for _ in 0..5 {
        bodies.push(
            client
                .get("http://127.0.0.1:4548/")
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap(),
        );
    }
    assert_eq!(bodies, vec!["first", "second", "third", "first", "second"]);
}

#[tokio::test]
async fn test_wait_behavior_delays_response() {
    let control = 2604;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5103,
            "stubs": [{"responses": [{
                "is": {"body": "slow"},
                "_behaviors": [{"wait": 500}]
            }]}]
        }))
        .send()
        .await
        .unwrap();

    let start = Instant::now();
    let body = client
        .get("http://127.0.0.1:5103/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(start.elapsed().as_millis() >= 450);
    assert_eq!(body, "slow");
}

#[tokio::test]
async fn test_delete_missing_imposter_is_idempotent() {
    let control = 2605;
    start_control_plane(control).await;
    let client = client();

    for _ in 0..2 {
        let response = client
            .delete(control_url(control, "/imposters/9999"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({}));
    }
}

#[tokio::test]
async fn test_port_conflict_yields_resource_conflict() {
    let control = 2606;
    start_control_plane(control).await;
    let client = client();

    let config = json!({"protocol": "http", "port": 5104});
    let first = client
        .post(control_url(control, "/imposters"))
        .json(&config)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);

    let second = client
        .post(control_url(control, "/imposters"))
        .json(&config)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 400);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], json!("resource conflict"));
}

#[tokio::test]
async fn test_replayable_excludes_runtime_state() {
    let control = 2607;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5105,
            "recordRequests": true,
            "stubs": [{"responses": [{"is": {"body": "x"}}]}]
        }))
        .send()
        .await
        .unwrap();
    client.get("http://127.0.0.1:5105/").send().await.unwrap();

    let replayable: Value = client
        .get(control_url(control, "/imposters/5105?replayable=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(replayable.get("requests").is_none());
    assert!(replayable.get("numberOfRequests").is_none());
    assert!(replayable.get("_links").is_none());
    assert!(replayable["stubs"][0].get("_links").is_none());
}

#[tokio::test]
async fn test_first_match_wins_and_stub_delete_reorders() {
    let control = 2608;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5106,
            "stubs": [
                {"responses": [{"is": {"body": "S1"}}]},
                {"responses": [{"is": {"body": "S2"}}]}
            ]
        }))
        .send()
        .await
        .unwrap();

    let body = client
        .get("http://127.0.0.1:5106/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "S1");

    let deleted = client
        .delete(control_url(control, "/imposters/5106/stubs/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let body = client
        .get("http://127.0.0.1:5106/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "S2");
}

#[tokio::test]
async fn test_put_stubs_resets_cursors() {
    let control = 2609;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5107,
            "stubs": [{"responses": [
                {"is": {"body": "a"}},
                {"is": {"body": "b"}}
            ]}]
        }))
        .send()
        .await
        .unwrap();

    // advance the cursor off zero
    client.get("http://127.0.0.1:5107/").send().await.unwrap();

    let replaced = client
        .put(control_url(control, "/imposters/5107/stubs"))
        .json(&json!({"stubs": [{"responses": [
            {"is": {"body": "fresh-1"}},
            {"is": {"body": "fresh-2"}}
        ]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(replaced.status(), 200);

    let body = client
        .get("http://127.0.0.1:5107/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "fresh-1");
}

#[tokio::test]
async fn test_clear_saved_requests_resets_counter() {
    let control = 2610;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({"protocol": "http", "port": 5108, "recordRequests": true}))
        .send()
        .await
        .unwrap();
    client.get("http://127.0.0.1:5108/").send().await.unwrap();

    client
        .delete(control_url(control, "/imposters/5108/savedRequests"))
        .send()
        .await
        .unwrap();

    let view: Value = client
        .get(control_url(control, "/imposters/5108"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["numberOfRequests"], json!(0));
    assert_eq!(view["requests"], json!([]));
}

#[tokio::test]
async fn test_invalid_json_body_is_taxonomy_error() {
    let control = 2611;
    start_control_plane(control).await;
    let client = client();

    let response = client
        .post(control_url(control, "/imposters"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], json!("invalid JSON"));
}

#[tokio::test]
async fn test_unsupported_protocol_rejected() {
    let control = 2612;
    start_control_plane(control).await;
    let client = client();

    let response = client
        .post(control_url(control, "/imposters"))
        .json(&json!({"protocol": "gopher", "port": 5109}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], json!("bad data"));
}

#[tokio::test]
async fn test_root_and_config_endpoints() {
    let control = 2613;
    start_control_plane(control).await;
    let client = client();

    let root: Value = client
        .get(control_url(control, "/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for rel in ["imposters", "config", "logs"] {
        assert!(root["_links"][rel]["href"].as_str().is_some(), "{rel}");
    }

    let config: Value = client
        .get(control_url(control, "/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(config["version"].as_str().is_some());
    assert_eq!(config["options"]["port"], json!(2613));
}

#[tokio::test]
async fn test_control_plane_cors_header() {
    let control = 2614;
    start_control_plane(control).await;
    let client = client();

    let response = client
        .get(control_url(control, "/imposters"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_plugin_callback_resolves_request() {
    let control = 2615;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5110,
            "stubs": [{
                "predicates": [{"equals": {"path": "/match-me"}}],
                "responses": [{"is": {"statusCode": 207, "body": "from-stub"}}]
            }]
        }))
        .send()
        .await
        .unwrap();

    let reply: Value = client
        .post(control_url(control, "/imposters/5110/_requests"))
        .json(&json!({"request": {
            "requestFrom": "127.0.0.1:64000",
            "method": "GET",
            "path": "/match-me",
            "query": {},
            "headers": {},
            "timestamp": "2025-01-01T00:00:00Z"
        }}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(reply["matched"], json!(true));
    assert_eq!(reply["stubIndex"], json!(0));
    assert_eq!(reply["response"]["statusCode"], json!(207));
    assert_eq!(reply["response"]["body"], json!("from-stub"));
}

#[tokio::test]
async fn test_deep_equals_query_strictness_end_to_end() {
    let control = 2616;
    start_control_plane(control).await;
    let client = client();

    client
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5111,
            "stubs": [{
                "predicates": [{"deepEquals": {"query": {"a": "1"}}}],
                "responses": [{"is": {"body": "exact"}}]
            }],
            "defaultResponse": {"statusCode": 404, "body": "no match"}
        }))
        .send()
        .await
        .unwrap();

    let matched = client
        .get("http://127.0.0.1:5111/?a=1")
        .send()
        .await
        .unwrap();
    assert_eq!(matched.text().await.unwrap(), "exact");

    let unmatched = client
        .get("http://127.0.0.1:5111/?a=1&b=2")
        .send()
        .await
        .unwrap();
    assert_eq!(unmatched.status(), 404);
    assert_eq!(unmatched.text().await.unwrap(), "no match");
}
