//! TCP, SMTP, HTTPS and fault-injection integration tests.

mod support;

use base64::Engine as _;
use serde_json::{json, Value};
use std::time::Duration;
use support::{client, control_url, start_control_plane, wait_for_port};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn test_tcp_binary_round_trip() {
    let control = 2701;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "tcp",
            "port": 9003,
            "mode": "binary",
            "recordRequests": true,
            "stubs": [{"responses": [{"is": {"data": b64(&[0xAA, 0xBB])}}]}]
        }))
        .send()
        .await
        .unwrap();
    wait_for_port(9003).await;

    let mut stream = TcpStream::connect("127.0.0.1:9003").await.unwrap();
    stream.write_all(&[0xFF, 0xFE, 0xFD]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0xAA, 0xBB]);

    let view: Value = http
        .get(control_url(control, "/imposters/9003"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["requests"][0]["data"], json!(b64(&[0xFF, 0xFE, 0xFD])));
}

#[tokio::test]
async fn test_tcp_text_newline_framing() {
    let control = 2702;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "tcp",
            "port": 9004,
            "mode": "text",
            "stubs": [{
                "predicates": [{"equals": {"data": "ping"}}],
                "responses": [{"is": {"data": "pong"}}]
            }]
        }))
        .send()
        .await
        .unwrap();
    wait_for_port(9004).await;

    let mut stream = TcpStream::connect("127.0.0.1:9004").await.unwrap();
    stream.write_all(b"ping\n").await.unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    // the session stays open for the next frame
    stream.write_all(b"ping\n").await.unwrap();
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");
}

#[tokio::test]
async fn test_tcp_end_of_request_resolver() {
    let control = 2703;
    start_control_plane(control).await;
    let http = client();

    // frames end with a semicolon instead of a newline
    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "tcp",
            "port": 9005,
            "mode": "text",
            "endOfRequestResolver": {"inject": "request.ends_with(\";\")"},
            "stubs": [{"responses": [{"is": {"data": "done"}}]}]
        }))
        .send()
        .await
        .unwrap();
    wait_for_port(9005).await;

    let mut stream = TcpStream::connect("127.0.0.1:9005").await.unwrap();
    stream.write_all(b"part one ").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"part two;").await.unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"done");
}

#[tokio::test]
async fn test_tcp_random_data_fault() {
    let control = 2704;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "tcp",
            "port": 9006,
            "mode": "text",
            "stubs": [{"responses": [{"fault": "random-data-then-close"}]}]
        }))
        .send()
        .await
        .unwrap();
    wait_for_port(9006).await;

    let mut stream = TcpStream::connect("127.0.0.1:9006").await.unwrap();
    stream.write_all(b"anything\n").await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, charade_server::protocols::random_close_payload());
}

#[tokio::test]
async fn test_http_connection_reset_fault() {
    let control = 2705;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5201,
            "stubs": [{"responses": [{"fault": "connection-reset-by-peer"}]}]
        }))
        .send()
        .await
        .unwrap();

    let result = http.get("http://127.0.0.1:5201/").send().await;
    assert!(result.is_err(), "expected a connection-level failure");
}

#[tokio::test]
async fn test_https_self_signed_and_key_safety() {
    let control = 2706;
    start_control_plane(control).await;
    let http = client();

    let created = http
        .post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "https",
            "port": 5551,
            "stubs": [{"responses": [{"is": {"body": "secure"}}]}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    let insecure = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let body = insecure
        .get("https://127.0.0.1:5551/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "secure");

    let view: Value = http
        .get(control_url(control, "/imposters/5551"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let fingerprint = view["certificateFingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(view.get("key").is_none());
}

async fn expect_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>, prefix: &str) {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(
        line.starts_with(prefix),
        "expected reply starting with {prefix}, got {line}"
    );
}

#[tokio::test]
async fn test_smtp_session_records_message() {
    let control = 2707;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({"protocol": "smtp", "port": 6465, "recordRequests": true}))
        .send()
        .await
        .unwrap();
    wait_for_port(6465).await;

    let stream = TcpStream::connect("127.0.0.1:6465").await.unwrap();
    let (read_half, mut write) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    expect_line(&mut reader, "220").await;
    write.write_all(b"EHLO tester\r\n").await.unwrap();
    expect_line(&mut reader, "250").await;

    // DATA before MAIL/RCPT is a bad sequence
    write.write_all(b"DATA\r\n").await.unwrap();
    expect_line(&mut reader, "503").await;

    write
        .write_all(b"MAIL FROM:<sender@example.test>\r\n")
        .await
        .unwrap();
    expect_line(&mut reader, "250").await;
    write
        .write_all(b"RCPT TO:<first@example.test>\r\n")
        .await
        .unwrap();
    expect_line(&mut reader, "250").await;
    write
        .write_all(b"RCPT TO:<second@example.test>\r\n")
        .await
        .unwrap();
    expect_line(&mut reader, "250").await;

    write.write_all(b"DATA\r\n").await.unwrap();
    expect_line(&mut reader, "354").await;
    write
        .write_all(
            b"From: Sender <sender@example.test>\r\n\
              To: first@example.test\r\n\
              Subject: greetings\r\n\
              \r\n\
              hello there\r\n\
              .\r\n",
        )
        .await
        .unwrap();
    expect_line(&mut reader, "250").await;

    // unknown verbs are a 500
    write.write_all(b"BOUNCE\r\n").await.unwrap();
    expect_line(&mut reader, "500").await;

    write.write_all(b"QUIT\r\n").await.unwrap();
    expect_line(&mut reader, "221").await;

    let view: Value = http
        .get(control_url(control, "/imposters/6465"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let request = &view["requests"][0];
    assert_eq!(request["envelopeFrom"], json!("sender@example.test"));
    assert_eq!(
        request["envelopeTo"],
        json!(["first@example.test", "second@example.test"])
    );
    assert_eq!(request["subject"], json!("greetings"));
    assert_eq!(request["text"], json!("hello there"));
    for field in ["cc", "bcc", "references", "inReplyTo", "attachments"] {
        assert_eq!(request[field], json!([]), "field {field}");
    }
    assert_eq!(view["numberOfRequests"], json!(1));
}

#[tokio::test]
async fn test_imposter_cors_preflight() {
    let control = 2708;
    start_control_plane(control).await;
    let http = client();

    http.post(control_url(control, "/imposters"))
        .json(&json!({
            "protocol": "http",
            "port": 5202,
            "allowCORS": true,
            "stubs": [{"responses": [{"is": {"body": "hi"}}]}]
        }))
        .send()
        .await
        .unwrap();

    let response = http
        .request(reqwest::Method::OPTIONS, "http://127.0.0.1:5202/anything")
        .header("Origin", "http://ui.example")
        .header("Access-Control-Request-Method", "PUT")
        .header("Access-Control-Request-Headers", "X-Custom")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://ui.example"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "PUT"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-headers")
            .unwrap(),
        "X-Custom"
    );
}
