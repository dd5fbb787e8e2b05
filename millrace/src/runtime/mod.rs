/// Harness builder.
pub mod builder;
/// The worker harness: dispatch, execution, and commit actors.
pub mod harness;

pub use builder::HarnessBuilder;
pub use harness::{RunState, StreamingWorkerHarness};
