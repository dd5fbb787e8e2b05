//! Test fixtures for millrace harnesses.
//!
//! Provides an in-memory [`millrace::WorkService`] that records every call,
//! a scripted executor factory for driving success and failure paths, an
//! in-memory state fetcher with token invalidation, and a fixed memory
//! gauge for exercising dispatch pushback.

mod executor;
mod memory;
mod service;
mod state;

pub use executor::{
    ExecutorBehavior, ExecutionRecord, ScriptedExecutorFactory,
};
pub use memory::FixedMemoryGauge;
pub use service::{work_batch, work_item, InMemoryWorkService};
pub use state::InMemoryStateFetcher;
