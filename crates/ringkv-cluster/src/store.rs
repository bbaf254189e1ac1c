//! Storage collaborators.
//!
//! The ring and membership code only needs a handful of operations from
//! the storage engine, the read cache and the key-ownership registry.
//! These traits describe them; the `Memory*` types are concurrent
//! in-memory implementations backed by `DashMap`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::hash::{hash_key, in_range, Position};

/// A key range to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange {
    /// Every key.
    All,
    /// Keys hashing into `[start, end)` on the ring.
    Span { start: Position, end: Position },
}

impl KeyRange {
    pub fn contains(&self, key: &str) -> bool {
        match *self {
            KeyRange::All => true,
            KeyRange::Span { start, end } => in_range(hash_key(key), start, end),
        }
    }
}

/// Durable key-value storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Stores a value, returning true if it replaced an existing one.
    fn put(&self, key: &str, value: &str) -> bool;

    /// Removes a key, returning true if it existed.
    fn delete(&self, key: &str) -> bool;

    /// Returns every pair whose key falls inside `range`.
    fn range_scan(&self, range: KeyRange) -> HashMap<String, String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read cache in front of [`Storage`].
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// Registry of which user wrote each key.
pub trait OwnerManager: Send + Sync {
    /// True if `user` may modify `key`: the key has no owner yet, or
    /// `user` is that owner.
    fn is_owner(&self, key: &str, user: &str) -> bool;

    /// Records `user` as the owner of an unowned key. Returns true if
    /// `user` owns the key afterwards. Check and insert are one step, so
    /// two users racing on a fresh key cannot both win.
    fn claim(&self, key: &str, user: &str) -> bool;
    fn remove_owner(&self, key: &str);
    fn range_scan(&self, range: KeyRange) -> HashMap<String, String>;
    fn merge(&self, owners: &HashMap<String, String>);
}

/// In-memory storage engine.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: &str, value: &str) -> bool {
        self.data.insert(key.to_owned(), value.to_owned()).is_some()
    }

    fn delete(&self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    fn range_scan(&self, range: KeyRange) -> HashMap<String, String> {
        self.data
            .iter()
            .filter(|e| range.contains(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Bounded cache that evicts in insertion order.
#[derive(Debug)]
pub struct MemoryCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` entries. A capacity of
    /// zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner
            .entries
            .insert(key.to_owned(), value.to_owned())
            .is_none()
        {
            inner.order.push_back(key.to_owned());
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }
}

/// In-memory ownership registry.
#[derive(Debug, Default)]
pub struct MemoryOwners {
    owners: DashMap<String, String>,
}

impl MemoryOwners {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnerManager for MemoryOwners {
    fn is_owner(&self, key: &str, user: &str) -> bool {
        self.owners.get(key).is_none_or(|owner| owner.value() == user)
    }

    fn claim(&self, key: &str, user: &str) -> bool {
        match self.owners.entry(key.to_owned()) {
            Entry::Occupied(e) => e.get() == user,
            Entry::Vacant(e) => {
                e.insert(user.to_owned());
                true
            }
        }
    }

    fn remove_owner(&self, key: &str) {
        self.owners.remove(key);
    }

    fn range_scan(&self, range: KeyRange) -> HashMap<String, String> {
        self.owners
            .iter()
            .filter(|e| range.contains(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn merge(&self, owners: &HashMap<String, String>) {
        for (key, user) in owners {
            self.owners.insert(key.clone(), user.clone());
        }
    }
}
