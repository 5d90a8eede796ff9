//! Token registry for routing events back to endpoints.
//!
//! Each endpoint bound to an engine gets a slab slot. The slot index is the
//! io_uring `user_data` or the mio `Token`, so an event finds its endpoint
//! in O(1). Slots hold weak references: the registry never keeps an
//! endpoint alive, and an endpoint unregisters itself when dropped.

use slab::Slab;
use std::sync::{Arc, Weak};

/// Slab of weakly-held endpoints keyed by token.
pub struct TokenRegistry<T: ?Sized> {
    entries: Slab<Weak<T>>,
}

impl<T: ?Sized> TokenRegistry<T> {
    /// Create a registry with room for `capacity` endpoints before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
        }
    }

    /// Register an endpoint and return its token.
    pub fn insert(&mut self, endpoint: Weak<T>) -> usize {
        self.entries.insert(endpoint)
    }

    /// Look up a live endpoint.
    ///
    /// Returns `None` if the token is free or the endpoint has been dropped.
    pub fn get(&self, token: usize) -> Option<Arc<T>> {
        self.entries.get(token).and_then(Weak::upgrade)
    }

    /// Free a token, making the slot available for reuse.
    pub fn remove(&mut self, token: usize) -> bool {
        self.entries.try_remove(token).is_some()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Debug;

    #[test]
    fn test_token_registry() {
        let mut registry: TokenRegistry<u32> = TokenRegistry::with_capacity(4);
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);

        let ta = registry.insert(Arc::downgrade(&a));
        let tb = registry.insert(Arc::downgrade(&b));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.get(ta).as_deref(), Some(&1));
        assert_eq!(registry.get(tb).as_deref(), Some(&2));

        // Remove and verify the slot is reused
        assert!(registry.remove(ta));
        assert!(!registry.remove(ta));
        assert!(registry.get(ta).is_none());

        let c = Arc::new(3u32);
        let tc = registry.insert(Arc::downgrade(&c));
        assert_eq!(tc, ta);
    }

    #[test]
    fn test_registry_does_not_keep_endpoints_alive() {
        let mut registry: TokenRegistry<dyn Debug + Send + Sync> = TokenRegistry::with_capacity(1);
        let endpoint: Arc<dyn Debug + Send + Sync> = Arc::new("endpoint");
        let token = registry.insert(Arc::downgrade(&endpoint));

        assert!(registry.get(token).is_some());
        drop(endpoint);

        // Slot still occupied, but the endpoint is gone
        assert!(registry.get(token).is_none());
        assert_eq!(registry.len(), 1);
    }
}
