use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use millrace::MemoryGauge;

/// Memory gauge with an adjustable reading, for driving dispatch pushback
/// in tests.
#[derive(Debug)]
pub struct FixedMemoryGauge {
    used: AtomicU64,
    ceiling: u64,
}

impl FixedMemoryGauge {
    /// Create a gauge with the given ceiling and zero use.
    pub fn new(ceiling: u64) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicU64::new(0),
            ceiling,
        })
    }

    /// Set the current reading.
    pub fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl MemoryGauge for FixedMemoryGauge {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn ceiling_bytes(&self) -> u64 {
        self.ceiling
    }
}
