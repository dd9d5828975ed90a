//! Replay protection: nonces seen within the window are rejected.

use std::time::Duration;

use moka::sync::Cache;

const MAX_NONCES: u64 = 1_000_000;

/// Shared across requests. Entries expire after the window.
pub struct NonceStore {
    seen: Cache<String, ()>,
}

impl NonceStore {
    pub fn new(window: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(MAX_NONCES)
            .time_to_live(window)
            .build();
        NonceStore { seen }
    }

    /// Record `nonce`. Returns `false` if it was already seen in the window.
    ///
    /// Insert-if-absent is atomic: of two concurrent callers with the same
    /// nonce exactly one gets `true`.
    pub fn check_and_insert(&self, nonce: &str) -> bool {
        self.seen.entry(nonce.to_string()).or_insert(()).is_fresh()
    }
}
