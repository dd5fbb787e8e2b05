//! A runnable worker wired to the in-memory service stub.
//!
//! Pre-registers one descriptor per positional argument, seeds a little
//! demo work, and serves the status page until interrupted:
//!
//! ```bash
//! cargo run --example local_worker -- '{"computation_id":"demo"}'
//! curl localhost:8081/
//! ```

use std::sync::Arc;

use clap::Parser;
use millrace::{
    StreamingWorkerHarness, StubRegistry, WorkService, WorkerConfig,
};
use millrace_testkit::{
    work_batch, work_item, InMemoryStateFetcher, InMemoryWorkService,
    ScriptedExecutorFactory,
};

#[derive(Parser)]
struct Args {
    /// Serialized computation descriptors to pre-register.
    descriptors: Vec<String>,

    /// Work service location.
    #[arg(long, default_value = "localhost:0")]
    hostport: String,

    /// Work service stub to construct.
    #[arg(long, default_value = "local")]
    stub: String,

    /// Status server port.
    #[arg(long, default_value_t = 8081)]
    status_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let backing = InMemoryWorkService::new();
    let mut stubs = StubRegistry::new();
    let registered = Arc::clone(&backing);
    stubs.register(
        "local",
        Box::new(move |_endpoint| {
            Ok(Arc::clone(&registered) as Arc<dyn WorkService>)
        }),
    );
    let service = stubs.create(&args.stub, &args.hostport)?;

    let config = WorkerConfig::new(args.hostport)
        .with_stub(args.stub)
        .with_status_port(args.status_port);

    let mut builder = StreamingWorkerHarness::builder()
        .config(config)
        .service(service)
        .executor_factory(Arc::new(ScriptedExecutorFactory::new()))
        .state_fetcher(InMemoryStateFetcher::new());
    if args.descriptors.is_empty() {
        builder = builder.register_serialized(r#"{"computation_id":"demo"}"#)?;
    }
    for descriptor in &args.descriptors {
        builder = builder.register_serialized(descriptor)?;
    }
    let harness = builder.build()?;

    // A bit of demo traffic so the status page has something to show.
    backing.push_work(vec![work_batch(
        "demo",
        1_000_000,
        vec![work_item(b"key-a", 1), work_item(b"key-b", 2)],
    )]);

    harness.start().await?;
    tracing::info!(client_id = harness.client_id(), "worker running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    harness.stop().await
}
