//! Per-channel live link-id tracking.
//!
//! `link_id` is a 32-bit value scoped to one control channel (§5: "A
//! central set tracks live ids across the process" — in this
//! implementation the set is scoped per [`crate::channel::ControlChannel`]
//! rather than truly process-global, since ids are never compared across
//! channels). Allocation draws uniformly at random and retries on
//! collision; recycling after a link closes is explicitly permitted by the
//! data model, so the allocator does not need a monotonic counter.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;

/// Tracks which `link_id`s are currently in use on one control channel.
#[derive(Debug, Default)]
pub struct LiveIds {
    live: Mutex<HashSet<u32>>,
}

impl LiveIds {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh random id, retrying on collision with a currently
    /// live one, and marks it live.
    pub fn allocate(&self) -> u32 {
        let mut live = self.live.lock();
        loop {
            let candidate = rand::rng().random::<u32>();
            if live.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Releases an id back to the pool, e.g. once its link reaches `CLOSED`.
    pub fn release(&self, link_id: u32) {
        self.live.lock().remove(&link_id);
    }
}
