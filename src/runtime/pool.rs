//! Pool of reusable connection objects.
//!
//! The pool tracks two disjoint sets: *active* connections handed out by
//! `get` and not yet released, and *available* connections ready for reuse.
//! Connections are created on demand through a creator closure and are only
//! destroyed when the pool is purged or dropped.
//!
//! Two policies are pluggable:
//! - the container holding each set (`ListContainer` in FIFO order, or
//!   `HashContainer` keyed by object identity)
//! - the lock guarding both sets (`std::sync::Mutex`, `parking_lot::Mutex`,
//!   or `RefCell` for single-threaded use)

use crate::error::Result;
use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::ops::DerefMut;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Container for one set of pooled connections.
///
/// Elements are compared by identity: two handles are the same element when
/// they point at the same allocation.
pub trait ConnectionContainer<C: ?Sized>: Default {
    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Insert a connection. Adding an element already present is a no-op.
    fn add(&mut self, connection: Arc<C>);

    /// Remove and return any one element.
    fn take(&mut self) -> Option<Arc<C>>;

    /// Remove a specific element. Removing an absent element is a no-op.
    fn remove(&mut self, connection: &Arc<C>) -> Option<Arc<C>>;

    fn contains(&self, connection: &Arc<C>) -> bool;

    /// Remove and return every element.
    fn drain_all(&mut self) -> Vec<Arc<C>>;
}

/// Identity of a pooled connection: the address of its allocation.
fn identity<C: ?Sized>(connection: &Arc<C>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

/// Sequence container. `take` hands out the oldest element first.
pub struct ListContainer<C: ?Sized> {
    items: VecDeque<Arc<C>>,
}

impl<C: ?Sized> Default for ListContainer<C> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<C: ?Sized> ConnectionContainer<C> for ListContainer<C> {
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn add(&mut self, connection: Arc<C>) {
        if !self.contains(&connection) {
            self.items.push_back(connection);
        }
    }

    fn take(&mut self) -> Option<Arc<C>> {
        self.items.pop_front()
    }

    fn remove(&mut self, connection: &Arc<C>) -> Option<Arc<C>> {
        let pos = self.items.iter().position(|c| Arc::ptr_eq(c, connection))?;
        self.items.remove(pos)
    }

    fn contains(&self, connection: &Arc<C>) -> bool {
        self.items.iter().any(|c| Arc::ptr_eq(c, connection))
    }

    fn drain_all(&mut self) -> Vec<Arc<C>> {
        self.items.drain(..).collect()
    }
}

/// Hashed container with O(1) membership checks.
pub struct HashContainer<C: ?Sized> {
    items: HashMap<usize, Arc<C>>,
}

impl<C: ?Sized> Default for HashContainer<C> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<C: ?Sized> ConnectionContainer<C> for HashContainer<C> {
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn add(&mut self, connection: Arc<C>) {
        self.items.entry(identity(&connection)).or_insert(connection);
    }

    fn take(&mut self) -> Option<Arc<C>> {
        let key = *self.items.keys().next()?;
        self.items.remove(&key)
    }

    fn remove(&mut self, connection: &Arc<C>) -> Option<Arc<C>> {
        self.items.remove(&identity(connection))
    }

    fn contains(&self, connection: &Arc<C>) -> bool {
        self.items.contains_key(&identity(connection))
    }

    fn drain_all(&mut self) -> Vec<Arc<C>> {
        self.items.drain().map(|(_, c)| c).collect()
    }
}

/// Locking policy guarding the pool's sets.
pub trait Lock<T> {
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    fn new(value: T) -> Self;

    fn acquire(&self) -> Self::Guard<'_>;
}

impl<T> Lock<T> for Mutex<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        Mutex::new(value)
    }

    fn acquire(&self) -> Self::Guard<'_> {
        // The sets stay consistent across a panic in any single call.
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Lock<T> for parking_lot::Mutex<T> {
    type Guard<'a>
        = parking_lot::MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        parking_lot::Mutex::new(value)
    }

    fn acquire(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

/// No-op locking for pools confined to one thread.
impl<T> Lock<T> for RefCell<T> {
    type Guard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        RefCell::new(value)
    }

    fn acquire(&self) -> Self::Guard<'_> {
        self.borrow_mut()
    }
}

/// The active and available sets, always guarded together.
pub struct PoolSets<K> {
    active: K,
    available: K,
}

impl<K: Default> Default for PoolSets<K> {
    fn default() -> Self {
        Self {
            active: K::default(),
            available: K::default(),
        }
    }
}

/// Creates a fresh connection when the pool has none available.
pub type Creator<C> = Box<dyn Fn() -> Result<Arc<C>> + Send + Sync>;

/// Pool of reusable connections.
///
/// Invariants:
/// - the active and available sets are disjoint
/// - every connection ever created is in exactly one of them until purged
pub struct ConnectionPool<C: ?Sized, K = ListContainer<C>, L = Mutex<PoolSets<K>>>
where
    K: ConnectionContainer<C>,
    L: Lock<PoolSets<K>>,
{
    sets: L,
    creator: Creator<C>,
    _container: std::marker::PhantomData<fn() -> K>,
}

impl<C, K, L> ConnectionPool<C, K, L>
where
    C: ?Sized,
    K: ConnectionContainer<C>,
    L: Lock<PoolSets<K>>,
{
    /// Create an empty pool.
    pub fn new<F>(creator: F) -> Self
    where
        F: Fn() -> Result<Arc<C>> + Send + Sync + 'static,
    {
        Self {
            sets: L::new(PoolSets::default()),
            creator: Box::new(creator),
            _container: std::marker::PhantomData,
        }
    }

    /// Create a pool with `count` connections already available.
    pub fn with_capacity<F>(count: usize, creator: F) -> Result<Self>
    where
        F: Fn() -> Result<Arc<C>> + Send + Sync + 'static,
    {
        let pool = Self::new(creator);
        pool.prefill(count)?;
        Ok(pool)
    }

    /// Create `count` connections and add them to the available set.
    pub fn prefill(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let connection = (self.creator)()?;
            self.sets.acquire().available.add(connection);
        }
        debug!(count, "Pool prefilled");
        Ok(())
    }

    /// Hand out a connection, reusing an available one if possible.
    ///
    /// The returned connection is in the active set until released.
    pub fn get(&self) -> Result<Arc<C>> {
        if let Some(connection) = self.take_available() {
            return Ok(connection);
        }

        // Create outside the lock; the creator may register with an engine.
        let connection = (self.creator)()?;
        self.sets.acquire().active.add(Arc::clone(&connection));
        Ok(connection)
    }

    fn take_available(&self) -> Option<Arc<C>> {
        let mut sets = self.sets.acquire();
        let connection = sets.available.take()?;
        sets.active.add(Arc::clone(&connection));
        Some(connection)
    }

    /// Move a connection from the active set back to the available set.
    ///
    /// Releasing a connection that is not active is a no-op.
    pub fn release(&self, connection: &Arc<C>) {
        let mut sets = self.sets.acquire();
        match sets.active.remove(connection) {
            Some(connection) => sets.available.add(connection),
            None => warn!("Released a connection that is not active"),
        }
    }

    pub fn is_active(&self, connection: &Arc<C>) -> bool {
        self.sets.acquire().active.contains(connection)
    }

    pub fn is_available(&self, connection: &Arc<C>) -> bool {
        self.sets.acquire().available.contains(connection)
    }

    pub fn active_len(&self) -> usize {
        self.sets.acquire().active.len()
    }

    pub fn available_len(&self) -> usize {
        self.sets.acquire().available.len()
    }

    /// Total number of connections owned by the pool.
    pub fn len(&self) -> usize {
        let sets = self.sets.acquire();
        sets.active.len() + sets.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every connection in both sets. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let drained = {
            let mut sets = self.sets.acquire();
            let mut drained = sets.active.drain_all();
            drained.extend(sets.available.drain_all());
            drained
        };
        // Connections are dropped here, after the lock is released, since
        // their teardown may call back into the engine.
        drained.len()
    }
}

impl<C, K, L> Drop for ConnectionPool<C, K, L>
where
    C: ?Sized,
    K: ConnectionContainer<C>,
    L: Lock<PoolSets<K>>,
{
    fn drop(&mut self) {
        let purged = self.purge();
        if purged > 0 {
            debug!(purged, "Pool destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Slot {
        id: usize,
    }

    fn counting_creator(created: Arc<AtomicUsize>) -> impl Fn() -> Result<Arc<Slot>> {
        move || {
            let id = created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Slot { id }))
        }
    }

    #[test]
    fn test_get_creates_on_demand() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool: ConnectionPool<Slot> = ConnectionPool::new(counting_creator(created.clone()));

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_len(), 2);
        assert_eq!(pool.available_len(), 0);
    }

    #[test]
    fn test_release_then_reuse() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool: ConnectionPool<Slot> = ConnectionPool::new(counting_creator(created.clone()));

        let a = pool.get().unwrap();
        pool.release(&a);
        assert!(!pool.is_active(&a));
        assert!(pool.is_available(&a));

        // Reused, not recreated
        let b = pool.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_capacity_prefills() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool: ConnectionPool<Slot> =
            ConnectionPool::with_capacity(3, counting_creator(created.clone())).unwrap();
        assert_eq!(pool.available_len(), 3);
        assert_eq!(pool.active_len(), 0);

        // Prefilled objects are handed out oldest first
        assert_eq!(pool.get().unwrap().id, 0);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_capacity_starts_empty() {
        let pool: ConnectionPool<Slot> =
            ConnectionPool::with_capacity(0, counting_creator(Arc::default())).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let pool: ConnectionPool<Slot> = ConnectionPool::new(counting_creator(Arc::default()));
        let stranger = Arc::new(Slot { id: 99 });

        pool.release(&stranger);
        assert!(pool.is_empty());

        // Double release does not duplicate
        let a = pool.get().unwrap();
        pool.release(&a);
        pool.release(&a);
        assert_eq!(pool.available_len(), 1);
        assert_eq!(pool.active_len(), 0);
    }

    #[test]
    fn test_creator_failure_propagates() {
        let pool: ConnectionPool<Slot> =
            ConnectionPool::new(|| Err(crate::Error::from_code(libc::EMFILE)));
        let err = pool.get().unwrap_err();
        assert_eq!(err.code(), Some(libc::EMFILE));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_purge_drops_connections() {
        let pool: ConnectionPool<Slot> =
            ConnectionPool::with_capacity(2, counting_creator(Arc::default())).unwrap();
        let held = pool.get().unwrap();

        assert_eq!(pool.purge(), 2);
        assert!(pool.is_empty());

        // Only our handle remains
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn test_hash_container_policy() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool: ConnectionPool<Slot, HashContainer<Slot>> =
            ConnectionPool::with_capacity(4, counting_creator(created.clone())).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(pool.is_active(&a));

        pool.release(&a);
        assert!(pool.is_available(&a));
        assert_eq!(pool.len(), 4);
        assert_eq!(created.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_parking_lot_policy() {
        let pool: ConnectionPool<Slot, ListContainer<Slot>, parking_lot::Mutex<PoolSets<ListContainer<Slot>>>> =
            ConnectionPool::new(counting_creator(Arc::default()));
        let a = pool.get().unwrap();
        pool.release(&a);
        assert_eq!(pool.available_len(), 1);
    }

    #[test]
    fn test_single_threaded_policy() {
        let pool: ConnectionPool<Slot, ListContainer<Slot>, RefCell<PoolSets<ListContainer<Slot>>>> =
            ConnectionPool::new(counting_creator(Arc::default()));
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.release(&b);
        assert!(pool.is_active(&a));
        assert!(pool.is_available(&b));
    }

    #[test]
    fn test_trait_object_connections() {
        trait Named: Send + Sync {
            fn name(&self) -> &'static str;
        }
        struct Echo;
        impl Named for Echo {
            fn name(&self) -> &'static str {
                "echo"
            }
        }

        let pool: ConnectionPool<dyn Named> =
            ConnectionPool::new(|| Ok(Arc::new(Echo) as Arc<dyn Named>));
        let conn = pool.get().unwrap();
        assert_eq!(conn.name(), "echo");
        pool.release(&conn);
        assert!(pool.is_available(&conn));
    }

    #[test]
    fn test_concurrent_get_release() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool: Arc<ConnectionPool<Slot>> =
            Arc::new(ConnectionPool::new(counting_creator(created.clone())));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let conn = pool.get().unwrap();
                        pool.release(&conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Never more objects than concurrent holders
        let total = created.load(Ordering::SeqCst);
        assert!(total <= 4);
        assert_eq!(pool.len(), total);
        assert_eq!(pool.active_len(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get,
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Get), (0usize..16).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn prop_sets_stay_disjoint(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let created = Arc::new(AtomicUsize::new(0));
            let pool: ConnectionPool<Slot> =
                ConnectionPool::new(counting_creator(created.clone()));
            let mut handed_out: Vec<Arc<Slot>> = Vec::new();

            for op in ops {
                match op {
                    Op::Get => handed_out.push(pool.get().unwrap()),
                    Op::Release(i) if !handed_out.is_empty() => {
                        let conn = handed_out.swap_remove(i % handed_out.len());
                        pool.release(&conn);
                    }
                    Op::Release(_) => {}
                }

                // Every created object is in exactly one set
                prop_assert_eq!(pool.len(), created.load(Ordering::SeqCst));
                prop_assert_eq!(pool.active_len(), handed_out.len());

                let ids: HashSet<usize> = handed_out.iter().map(|c| c.id).collect();
                prop_assert_eq!(ids.len(), handed_out.len());
                for conn in &handed_out {
                    prop_assert!(pool.is_active(conn));
                    prop_assert!(!pool.is_available(conn));
                }
            }
        }
    }
}
