//! Stream registry (C4): the per-control-channel map from `link_id` to
//! [`Link`].
//!
//! Guarded by a `parking_lot::Mutex` on the same discipline the crate uses
//! elsewhere for short, synchronous critical sections: no `.await` is ever
//! held across the lock. Callers needing to do async work (write to a
//! socket, send a frame) must pull what they need out of the closure's
//! return value first.

use crate::link::Link;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Live links for one control channel.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: Mutex<HashMap<u32, Link>>,
}

impl LinkRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new link, overwriting any existing entry for the same id
    /// (callers are expected to have allocated a fresh id via
    /// [`crate::ids::LiveIds`], so collisions should not happen in
    /// practice).
    pub fn insert(&self, link: Link) {
        self.links.lock().insert(link.link_id(), link);
    }

    /// Runs `f` against the link for `link_id`, if it is still present.
    /// Returns `None` if the link is unknown — callers should log and drop
    /// per §4.4/§7 (`LinkUnknown`).
    pub fn with_link<R>(&self, link_id: u32, f: impl FnOnce(&mut Link) -> R) -> Option<R> {
        self.links.lock().get_mut(&link_id).map(f)
    }

    /// Whether `link_id` is currently registered.
    #[must_use]
    pub fn contains(&self, link_id: u32) -> bool {
        self.links.lock().contains_key(&link_id)
    }

    /// Removes and returns the link for `link_id`, if present.
    pub fn remove(&self, link_id: u32) -> Option<Link> {
        self.links.lock().remove(&link_id)
    }

    /// Number of currently registered links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// Whether the registry currently holds no links.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Removes every link and returns them, in no particular order. Used on
    /// channel teardown (§4.2: "closing the channel closes all its links").
    pub fn drain_all(&self) -> Vec<Link> {
        self.links.lock().drain().map(|(_, link)| link).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let registry = LinkRegistry::new();
        registry.insert(Link::new(1));
        assert!(registry.contains(1));
        assert!(!registry.contains(2));
    }

    #[test]
    fn with_link_mutates_in_place() {
        let registry = LinkRegistry::new();
        registry.insert(Link::new(1));
        let confirmed = registry
            .with_link(1, |link| link.confirm().is_ok())
            .unwrap();
        assert!(confirmed);
        assert!(registry.with_link(1, crate::link::Link::is_confirmed).unwrap());
    }

    #[test]
    fn with_link_on_unknown_id_returns_none() {
        let registry = LinkRegistry::new();
        assert!(registry.with_link(99, |_| ()).is_none());
    }

    #[test]
    fn remove_drops_from_registry() {
        let registry = LinkRegistry::new();
        registry.insert(Link::new(1));
        assert!(registry.remove(1).is_some());
        assert!(!registry.contains(1));
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn drain_all_empties_the_registry() {
        let registry = LinkRegistry::new();
        registry.insert(Link::new(1));
        registry.insert(Link::new(2));
        assert_eq!(registry.len(), 2);
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
