//! Lock-protected bundle collections
//!
//! Three collection shapes share one design: an internal container behind
//! the list's lock, and an injective mapping from every contained bundle
//! back to the bundle's mapping set. Every mutation keeps the invariant
//!
//! ```text
//! bundle.mappings.contains(list.id)  <=>  list.contains(bundle)
//! ```
//!
//! by taking the list lock first and the bundle's mapping lock second
//! (never the other way around). Adding a bundle that is already on the
//! list is rejected and logged; no state changes.
//!
//! The ordered list additionally carries a counting semaphore so a
//! consumer task can block on `pop_front_blocking` with a timeout.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::error;

use crate::bundle::BundleRef;

/// Identifier of a list instance, unique for the process lifetime
pub type ListId = u32;

static NEXT_LIST_ID: AtomicU32 = AtomicU32::new(1);

fn alloc_list_id() -> ListId {
    NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed)
}

/// An ordered bundle list (insertion order or caller-sorted)
#[derive(Debug)]
pub struct BundleList {
    id: ListId,
    name: String,
    entries: Mutex<VecDeque<BundleRef>>,
    available: Semaphore,
}

impl BundleList {
    /// Create an empty named list
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: alloc_list_id(),
            name: name.into(),
            entries: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    /// This list's id (the value stored in bundle mapping sets)
    pub fn id(&self) -> ListId {
        self.id
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn claim_mapping(&self, bundle: &BundleRef) -> bool {
        if !bundle.add_mapping(self.id) {
            error!(
                list = %self.name,
                bundle = %bundle,
                "rejecting double add to list"
            );
            return false;
        }
        true
    }

    /// Append at the back; false if the bundle is already on the list
    pub fn push_back(&self, bundle: BundleRef) -> bool {
        let mut entries = self.entries.lock();
        if !self.claim_mapping(&bundle) {
            return false;
        }
        entries.push_back(bundle);
        self.available.add_permits(1);
        true
    }

    /// Insert at the front; false if the bundle is already on the list
    pub fn push_front(&self, bundle: BundleRef) -> bool {
        let mut entries = self.entries.lock();
        if !self.claim_mapping(&bundle) {
            return false;
        }
        entries.push_front(bundle);
        self.available.add_permits(1);
        true
    }

    /// Insert keeping the list sorted by `key`, stable for equal keys
    pub fn insert_sorted<K, F>(&self, bundle: BundleRef, key: F) -> bool
    where
        K: Ord,
        F: Fn(&BundleRef) -> K,
    {
        let mut entries = self.entries.lock();
        if !self.claim_mapping(&bundle) {
            return false;
        }
        let k = key(&bundle);
        let pos = entries.partition_point(|b| key(b) <= k);
        entries.insert(pos, bundle);
        self.available.add_permits(1);
        true
    }

    fn take(&self, popped: BundleRef) -> BundleRef {
        popped.remove_mapping(self.id);
        if let Ok(permit) = self.available.try_acquire() {
            permit.forget();
        }
        popped
    }

    /// Remove and return the front bundle, if any
    pub fn pop_front(&self) -> Option<BundleRef> {
        let mut entries = self.entries.lock();
        entries.pop_front().map(|b| self.take(b))
    }

    /// Remove and return the back bundle, if any
    pub fn pop_back(&self) -> Option<BundleRef> {
        let mut entries = self.entries.lock();
        entries.pop_back().map(|b| self.take(b))
    }

    /// Block up to `timeout` for a bundle to pop from the front
    ///
    /// Returns `None` on timeout or when the list is shut down.
    pub async fn pop_front_blocking(&self, timeout: Duration) -> Option<BundleRef> {
        match tokio::time::timeout(timeout, self.available.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let mut entries = self.entries.lock();
                // A permit was claimed, so an element is guaranteed
                entries.pop_front().map(|b| {
                    b.remove_mapping(self.id);
                    b
                })
            }
            _ => None,
        }
    }

    /// Remove a specific bundle; false if it is not on the list
    pub fn erase(&self, bundle: &BundleRef) -> bool {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|b| b.id() == bundle.id());
        match pos {
            Some(i) => {
                let removed = entries.remove(i).expect("position valid under lock");
                self.take(removed);
                true
            }
            None => false,
        }
    }

    /// Whether the bundle is on the list
    pub fn contains(&self, bundle: &BundleRef) -> bool {
        bundle.is_on_list(self.id)
    }

    /// Find by node-local bundle id
    pub fn find(&self, bundle_id: u64) -> Option<BundleRef> {
        self.entries
            .lock()
            .iter()
            .find(|b| b.id() == bundle_id)
            .cloned()
    }

    /// Find by GBOF key string
    pub fn find_gbof(&self, key: &str) -> Option<BundleRef> {
        self.entries
            .lock()
            .iter()
            .find(|b| b.gbof().to_key() == key)
            .cloned()
    }

    /// Number of bundles on the list
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every bundle, returning them in order
    pub fn drain(&self) -> Vec<BundleRef> {
        let mut entries = self.entries.lock();
        let drained: Vec<BundleRef> = entries.drain(..).collect();
        for b in &drained {
            b.remove_mapping(self.id);
            if let Ok(permit) = self.available.try_acquire() {
                permit.forget();
            }
        }
        drained
    }

    /// Clone the current contents without removing them
    pub fn snapshot(&self) -> Vec<BundleRef> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// A bundle map keyed by an integer (bundle id, custody id)
#[derive(Debug)]
pub struct BundleIntMap {
    id: ListId,
    name: String,
    entries: Mutex<BTreeMap<u64, BundleRef>>,
}

impl BundleIntMap {
    /// Create an empty named map
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: alloc_list_id(),
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// This map's list id
    pub fn id(&self) -> ListId {
        self.id
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert under `key`; false on double add or occupied key
    pub fn insert(&self, key: u64, bundle: BundleRef) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            error!(list = %self.name, key, "rejecting insert over occupied key");
            return false;
        }
        if !bundle.add_mapping(self.id) {
            error!(list = %self.name, bundle = %bundle, "rejecting double add to map");
            return false;
        }
        entries.insert(key, bundle);
        true
    }

    /// Look up by exact key
    pub fn find(&self, key: u64) -> Option<BundleRef> {
        self.entries.lock().get(&key).cloned()
    }

    /// First entry with key >= `key` (range scan support)
    pub fn find_next(&self, key: u64) -> Option<(u64, BundleRef)> {
        self.entries
            .lock()
            .range(key..)
            .next()
            .map(|(k, b)| (*k, b.clone()))
    }

    /// Remove the entry under `key`, returning the bundle
    pub fn erase(&self, key: u64) -> Option<BundleRef> {
        let mut entries = self.entries.lock();
        entries.remove(&key).inspect(|b| {
            b.remove_mapping(self.id);
        })
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: u64) -> bool {
        self.entries.lock().contains_key(&key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the keys, ascending
    pub fn keys(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    /// Snapshot of the bundles, ascending by key
    pub fn values(&self) -> Vec<BundleRef> {
        self.entries.lock().values().cloned().collect()
    }
}

/// A bundle multimap keyed by string (GBOF key for duplicate detection)
#[derive(Debug)]
pub struct BundleStrMultiMap {
    id: ListId,
    name: String,
    entries: Mutex<BTreeMap<String, Vec<BundleRef>>>,
}

impl BundleStrMultiMap {
    /// Create an empty named multimap
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: alloc_list_id(),
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// This multimap's list id
    pub fn id(&self) -> ListId {
        self.id
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert under `key`; false if the bundle is already in the multimap
    pub fn insert(&self, key: &str, bundle: BundleRef) -> bool {
        let mut entries = self.entries.lock();
        if !bundle.add_mapping(self.id) {
            error!(list = %self.name, bundle = %bundle, "rejecting double add to multimap");
            return false;
        }
        entries.entry(key.to_string()).or_default().push(bundle);
        true
    }

    /// Any bundle stored under `key`
    pub fn find_first(&self, key: &str) -> Option<BundleRef> {
        self.entries
            .lock()
            .get(key)
            .and_then(|v| v.first().cloned())
    }

    /// All bundles stored under `key`
    pub fn find_all(&self, key: &str) -> Vec<BundleRef> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    /// Remove one bundle from under `key`; false if absent
    pub fn erase_bundle(&self, key: &str, bundle: &BundleRef) -> bool {
        let mut entries = self.entries.lock();
        let Some(v) = entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = v.iter().position(|b| b.id() == bundle.id()) else {
            return false;
        };
        let removed = v.remove(pos);
        removed.remove_mapping(self.id);
        if v.is_empty() {
            entries.remove(key);
        }
        true
    }

    /// Remove every bundle under `key`
    pub fn erase_all(&self, key: &str) -> Vec<BundleRef> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(key).unwrap_or_default();
        for b in &removed {
            b.remove_mapping(self.id);
        }
        removed
    }

    /// Whether any bundle is stored under `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Total number of stored bundles across all keys
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    /// Whether the multimap is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
