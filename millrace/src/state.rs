//! Keyed-state reads for executing work items.

use async_trait::async_trait;

use crate::descriptor::ComputationId;

/// Reads per-key persistent state from the coordination service.
///
/// One fetcher is created against the service at startup and handed to
/// every execution context as an injected capability. Fetches are scoped by
/// the item's `(key, work_token)`; a fetch under a stale token fails with
/// [`crate::failure::KeyTokenInvalid`] somewhere in the error chain.
#[async_trait]
pub trait StateFetcher: Send + Sync {
    /// Fetch the value stored under `tag` for the given key, or `None` when
    /// the tag has never been written.
    async fn fetch_value(
        &self,
        computation_id: &ComputationId,
        key: &[u8],
        work_token: u64,
        tag: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>>;
}
