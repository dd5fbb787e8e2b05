use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use millrace::{ComputationId, KeyTokenInvalid, StateFetcher};
use parking_lot::Mutex;

/// In-memory keyed-state fetcher.
///
/// Values are keyed by state tag. Tokens marked invalid make every fetch
/// under them fail with a stale-token error in the cause chain, the way the
/// real service signals a reassigned key.
#[derive(Default)]
pub struct InMemoryStateFetcher {
    values: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    invalid_tokens: Mutex<HashSet<u64>>,
}

impl InMemoryStateFetcher {
    /// Create an empty fetcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a value under `tag`.
    pub fn insert_value(&self, tag: &[u8], value: &[u8]) {
        self.values.lock().insert(tag.to_vec(), value.to_vec());
    }

    /// Make fetches under `work_token` fail as stale.
    pub fn invalidate_token(&self, work_token: u64) {
        self.invalid_tokens.lock().insert(work_token);
    }
}

#[async_trait]
impl StateFetcher for InMemoryStateFetcher {
    async fn fetch_value(
        &self,
        _computation_id: &ComputationId,
        key: &[u8],
        work_token: u64,
        tag: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if self.invalid_tokens.lock().contains(&work_token) {
            return Err(anyhow::Error::new(KeyTokenInvalid::new(key)))
                .context("fetching keyed state");
        }
        Ok(self.values.lock().get(tag).cloned())
    }
}
