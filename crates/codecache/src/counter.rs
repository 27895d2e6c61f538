//! Invocation counter for compilation tiering.
//!
//! Tracks how many times each method has been invoked through the
//! interpreter. The manager compares the count against the configured
//! compile threshold to decide when a method should be queued.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::types::MethodId;

/// Thread-safe invocation counter keyed by method.
///
/// Values are `AtomicU64` so that `increment()` only needs a read lock for
/// methods that were already seen.
#[derive(Debug, Default)]
pub struct InvocationCounter {
    counts: RwLock<FxHashMap<MethodId, AtomicU64>>,
}

impl InvocationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the invocation count for a method. Returns the new count.
    pub fn increment(&self, method: MethodId) -> u64 {
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let counts = self.counts.read().unwrap();
            if let Some(counter) = counts.get(&method) {
                return counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            }
        }

        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut counts = self.counts.write().unwrap();
        // Another thread may have inserted between dropping the read lock and
        // taking the write lock.
        if let Some(counter) = counts.get(&method) {
            return counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        }
        counts.insert(method, AtomicU64::new(1));
        1
    }

    pub fn get(&self, method: MethodId) -> u64 {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let counts = self.counts.read().unwrap();
        counts
            .get(&method)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Restart counting for a method, e.g. after it was deoptimized.
    pub fn reset(&self, method: MethodId) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut counts = self.counts.write().unwrap();
        counts.remove(&method);
    }

    /// Remove all counts.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn clear(&self) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut counts = self.counts.write().unwrap();
        counts.clear();
    }
}
