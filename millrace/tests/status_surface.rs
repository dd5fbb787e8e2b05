//! Status server tests over a real socket.

use std::sync::Arc;

use millrace::{
    ComputationDescriptor, ComputationId, StreamingWorkerHarness, WorkerConfig,
};
use millrace_testkit::{
    InMemoryStateFetcher, InMemoryWorkService, ScriptedExecutorFactory,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect to status server");
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn harness() -> StreamingWorkerHarness {
    // Port 0 binds ephemerally so parallel tests do not collide.
    let config = WorkerConfig::new("test:0").with_status_port(0);
    StreamingWorkerHarness::builder()
        .config(config)
        .service(InMemoryWorkService::new())
        .executor_factory(Arc::new(ScriptedExecutorFactory::new()))
        .state_fetcher(InMemoryStateFetcher::new())
        .register(ComputationDescriptor {
            computation_id: ComputationId::from("c1"),
            stages: serde_json::json!([{"read": "source"}]),
        })
        .build()
        .expect("harness build failed")
}

#[tokio::test]
async fn test_healthz() {
    let harness = harness();
    harness.start().await.unwrap();
    let addr = harness.status_addr().expect("status server address");

    let response = http_get(addr, "/healthz").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_threadz_reports_actors() {
    let harness = harness();
    harness.start().await.unwrap();
    let addr = harness.status_addr().unwrap();

    let response = http_get(addr, "/threadz").await;
    assert!(response.contains("dispatch: running"));
    assert!(response.contains("pool:"));
    assert!(response.contains("computation c1:"));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_page_renders_overview() {
    let harness = harness();
    harness.start().await.unwrap();
    let addr = harness.status_addr().unwrap();

    let response = http_get(addr, "/anything-else").await;
    assert!(response.contains("Streaming Worker Harness"));
    assert!(response.contains("Running: true"));
    assert!(response.contains(&format!("ID: {}", harness.client_id())));
    assert!(response.contains("Commit Queues"));
    assert!(response.contains("<h3>c1</h3>"));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_shuts_status_server_down() {
    let harness = harness();
    harness.start().await.unwrap();
    let addr = harness.status_addr().unwrap();
    harness.stop().await.unwrap();

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
