//! LRU cache of open payload file descriptors
//!
//! Bounds the number of payload files the store holds open. Eviction only
//! closes the descriptor; the file stays on disk and is reopened on the
//! next access. Readers share the descriptor through positioned reads, so
//! concurrent reads never race on a file offset.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

struct CachedFd {
    file: Arc<File>,
    last_used: u64,
}

/// An LRU-bounded map of bundle id to open payload file
#[derive(Debug)]
pub struct FdCache {
    capacity: usize,
    inner: Mutex<FdCacheInner>,
}

struct FdCacheInner {
    entries: HashMap<u64, CachedFd>,
    clock: u64,
}

impl std::fmt::Debug for FdCacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdCacheInner")
            .field("open", &self.entries.len())
            .finish()
    }
}

impl FdCache {
    /// Create a cache holding at most `capacity` open descriptors
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(FdCacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// The configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently open descriptors
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no descriptors are open
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Fetch the descriptor for `id`, opening `path` on a miss
    ///
    /// Evicts the least recently used entry when at capacity.
    pub fn get_or_open(&self, id: u64, path: &Path) -> io::Result<Arc<File>> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;

        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.last_used = now;
            return Ok(entry.file.clone());
        }

        if inner.entries.len() >= self.capacity {
            if let Some((&victim, _)) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
            {
                inner.entries.remove(&victim);
                trace!(bundle_id = victim, "evicted payload fd");
            }
        }

        let file = Arc::new(File::open(path)?);
        inner.entries.insert(
            id,
            CachedFd {
                file: file.clone(),
                last_used: now,
            },
        );
        Ok(file)
    }

    /// Drop the descriptor for `id` (payload file deleted)
    pub fn remove(&self, id: u64) {
        self.inner.lock().entries.remove(&id);
    }

    /// Drop every cached descriptor
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_hit_reuses_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "1.pay", b"abc");
        let cache = FdCache::new(4);

        let a = cache.get_or_open(1, &path).unwrap();
        let b = cache.get_or_open(1, &path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let dir = TempDir::new().unwrap();
        let cache = FdCache::new(2);

        let p1 = write_file(&dir, "1.pay", b"a");
        let p2 = write_file(&dir, "2.pay", b"b");
        let p3 = write_file(&dir, "3.pay", b"c");

        cache.get_or_open(1, &p1).unwrap();
        cache.get_or_open(2, &p2).unwrap();
        // Touch 1 so 2 becomes the LRU victim
        cache.get_or_open(1, &p1).unwrap();
        cache.get_or_open(3, &p3).unwrap();

        assert_eq!(cache.len(), 2);
        // Evicted file is still on disk and reopens fine
        assert!(cache.get_or_open(2, &p2).is_ok());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "1.pay", b"abc");
        let cache = FdCache::new(4);

        cache.get_or_open(1, &path).unwrap();
        cache.remove(1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_miss_on_absent_file() {
        let dir = TempDir::new().unwrap();
        let cache = FdCache::new(4);
        assert!(cache
            .get_or_open(9, &dir.path().join("missing.pay"))
            .is_err());
    }
}
