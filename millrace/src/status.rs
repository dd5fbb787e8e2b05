//! HTTP status surface, off the hot path.
//!
//! Serves `/healthz` for probes, `/threadz` for a plain-text actor
//! inventory, and an HTML overview on every other path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::runtime::harness::HarnessInner;

pub(crate) struct StatusServer {
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl StatusServer {
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

pub(crate) async fn bind(
    inner: Arc<HarnessInner>,
    port: u16,
) -> anyhow::Result<StatusServer> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/threadz", get(threadz))
        .fallback(status_page)
        .with_state(inner);

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await?;
    let addr = listener.local_addr()?;

    let shutdown = Arc::new(Notify::new());
    let notified = Arc::clone(&shutdown);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        notified.notified().await;
    });
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::warn!(error = %err, "status server failed");
        }
    });

    Ok(StatusServer {
        addr,
        shutdown,
        handle,
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn threadz(State(inner): State<Arc<HarnessInner>>) -> String {
    let pool = &inner.pool;
    let mut out = String::new();
    out.push_str(&format!(
        "dispatch: {}\n",
        if inner.running.is_running() {
            "running"
        } else {
            "stopped"
        }
    ));
    out.push_str(&format!(
        "commit: {}\n",
        if inner.running.is_running() {
            "running"
        } else {
            "stopped"
        }
    ));
    out.push_str(&format!(
        "pool: {} workers, {} active, {} queued, {} forced\n",
        pool.worker_count(),
        pool.active_count(),
        pool.queue_depth(),
        pool.forced_depth(),
    ));
    for (computation_id, state) in inner.registry.snapshot() {
        out.push_str(&format!(
            "computation {}: {} commits queued, {} idle executors\n",
            computation_id,
            state.output_queue().len(),
            state.executors().depth(),
        ));
    }
    out
}

async fn status_page(State(inner): State<Arc<HarnessInner>>) -> Html<String> {
    let mut page = String::from("<html><body>");

    page.push_str("<h1>Streaming Worker Harness</h1>");
    page.push_str(&format!(
        "Running: {}<br>",
        inner.running.is_running()
    ));
    page.push_str(&format!("ID: {}<br>", inner.client_id));

    let pool = &inner.pool;
    page.push_str("<h2>Metrics</h2>");
    page.push_str(&format!(
        "Workers: {}/{}<br>",
        pool.worker_count(),
        pool.max_workers()
    ));
    page.push_str(&format!("Active Workers: {}<br>", pool.active_count()));
    page.push_str(&format!(
        "Work Queue Size: {}/{}<br>",
        pool.queue_depth(),
        pool.max_queue()
    ));
    page.push_str("Commit Queues: <ul>");
    for (computation_id, state) in inner.registry.snapshot() {
        page.push_str(&format!(
            "<li>{}: {}</li>",
            computation_id,
            state.output_queue().len()
        ));
    }
    page.push_str("</ul>");

    page.push_str("<h2>Resources</h2>");
    page.push_str(&format!(
        "Used Memory: {}MB<br>",
        inner.memory.used_bytes() >> 20
    ));
    let ceiling = inner.memory.ceiling_bytes();
    if ceiling == u64::MAX {
        page.push_str("Memory Ceiling: unlimited<br>");
    } else {
        page.push_str(&format!("Memory Ceiling: {}MB<br>", ceiling >> 20));
    }

    if let Some(last) = inner.last_exception.get() {
        page.push_str("<h2>Last Exception</h2>");
        page.push_str(&last.replace('\n', "<br>"));
    }

    page.push_str("<h2>Specs</h2>");
    for (computation_id, state) in inner.registry.snapshot() {
        page.push_str(&format!("<h3>{computation_id}</h3>"));
        let rendered = serde_json::to_string_pretty(state.descriptor())
            .unwrap_or_else(|_| "<unrenderable>".to_string());
        page.push_str(&format!("<pre>{rendered}</pre>"));
    }

    page.push_str("</body></html>");
    Html(page)
}
