use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use axum::routing::post;
use json_post_runner::{
    RequestPayload, RequestRunner, RunnerConfig, RunnerErrorKind, json_headers,
};
use tokio::net::TcpListener;
use tokio::time::sleep;

fn greeting() -> RequestPayload {
    RequestPayload::new()
        .with("msg", "Hello")
        .with("user", "Sebastian")
        .with("id", 123)
}

#[tokio::test]
async fn e2e_post_is_echoed_back() {
    let server = TestServer::start().await;
    let runner = RequestRunner::new(RunnerConfig::new(server.url("/post")));
    let payload = greeting();

    let response = runner.run(&payload).await.expect("echo server should answer");

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), payload.to_json().expect("payload should serialize"));
}

#[tokio::test]
async fn e2e_server_sees_json_content_type() {
    let server = TestServer::start().await;
    let runner = RequestRunner::new(RunnerConfig::new(server.url("/content-type")));

    let response = runner
        .submit_payload(&greeting(), &server.url("/content-type"), json_headers())
        .expect("submission should succeed")
        .wait()
        .await
        .expect("server should answer");

    assert_eq!(response.text(), "application/json");
}

#[tokio::test]
async fn e2e_error_status_is_returned_as_result() {
    let server = TestServer::start().await;
    let runner = RequestRunner::new(RunnerConfig::new(server.url("/unavailable")));

    let response = runner.run(&greeting()).await.expect("503 is still a response");
    assert_eq!(response.status(), 503);
    assert_eq!(response.text(), "service unavailable");
}

#[tokio::test]
async fn e2e_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind throwaway listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let runner = RequestRunner::new(RunnerConfig::new(format!("http://{addr}/post")));
    let err = runner
        .run(&greeting())
        .await
        .expect_err("closed port should refuse the connection");

    assert_eq!(err.kind(), RunnerErrorKind::Network);
}

#[tokio::test]
async fn e2e_timeout_is_network_error() {
    let server = TestServer::start().await;
    let runner = RequestRunner::new(
        RunnerConfig::new(server.url("/slow")).with_timeout(Duration::from_millis(200)),
    );

    let err = runner.run(&greeting()).await.expect_err("timeout should trigger");
    assert_eq!(err.kind(), RunnerErrorKind::Network);
}

#[tokio::test]
async fn e2e_garbage_response_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind raw listener");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"this is not http\r\n\r\n").await;
            let _ = stream.flush().await;
            sleep(Duration::from_millis(200)).await;
        }
    });

    let runner = RequestRunner::new(RunnerConfig::new(format!("http://{addr}/post")));
    let err = runner
        .run(&greeting())
        .await
        .expect_err("garbage status line should fail");
    task.abort();

    assert_eq!(err.kind(), RunnerErrorKind::Protocol);
}

#[tokio::test]
async fn e2e_connection_closed_without_response_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind raw listener");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;

        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            drop(stream);
        }
    });

    let runner = RequestRunner::new(RunnerConfig::new(format!("http://{addr}/post")));
    let err = runner
        .run(&greeting())
        .await
        .expect_err("closed connection should fail");
    task.abort();

    assert_eq!(err.kind(), RunnerErrorKind::Network, "unexpected error: {err}");
}

struct TestServer {
    base_url: String,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let app = Router::new()
            .route("/post", post(echo_handler))
            .route("/content-type", post(content_type_handler))
            .route("/unavailable", post(unavailable_handler))
            .route("/slow", post(slow_handler));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url, task }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn echo_handler(body: Bytes) -> (StatusCode, Bytes) {
    (StatusCode::OK, body)
}

async fn content_type_handler(headers: HeaderMap) -> (StatusCode, String) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (StatusCode::OK, content_type)
}

async fn unavailable_handler() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
}

async fn slow_handler() -> (StatusCode, &'static str) {
    sleep(Duration::from_millis(2500)).await;
    (StatusCode::OK, "too late")
}
