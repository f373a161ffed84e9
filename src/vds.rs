//! Bounded cache of externally opened legacy containers.
//!
//! Slice reads against the legacy `LOCAL`/`DSDS` protocols reopen the same
//! container many times within one request, so open handles are cached under
//! an opaque key. The cache is bounded: when an insert finds it full, about
//! half of the entries are evicted in insertion order. It is process-local
//! state owned by the exporter context and must never be shared between
//! concurrently executing requests.

use std::collections::HashMap;

use tracing::debug;

pub const DEFAULT_MAX_HANDLES: usize = 256;

#[derive(Debug)]
pub struct VdsCache<T> {
    max: usize,
    entries: HashMap<String, T>,
    order: Vec<String>,
}

impl<T> VdsCache<T> {
    pub fn new(max: usize) -> VdsCache<T> {
        VdsCache {
            max: max.max(2),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: &str) -> Option<&T> {
        self.entries.get(handle)
    }

    /// Insert a freshly opened container, evicting roughly half of the
    /// cache first if it is full. Re-inserting an existing handle replaces
    /// the container.
    pub fn insert(&mut self, handle: &str, value: T) {
        if !self.entries.contains_key(handle) && self.entries.len() >= self.max {
            self.purge_half();
        }

        if self.entries.insert(handle.to_owned(), value).is_none() {
            self.order.push(handle.to_owned());
        }
    }

    /// Remove the entry for a handle (the owning request is closing).
    pub fn remove(&mut self, handle: &str) -> Option<T> {
        self.order.retain(|h| h != handle);
        self.entries.remove(handle)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn purge_half(&mut self) {
        let target = self.entries.len() / 2;
        debug!(
            have = self.entries.len(),
            target, "purging VDS handle cache"
        );

        while self.entries.len() > target {
            let victim = match self.order.first() {
                Some(v) => v.clone(),
                None => break,
            };
            self.order.remove(0);
            self.entries.remove(&victim);
        }
    }
}

impl<T> Default for VdsCache<T> {
    fn default() -> Self {
        VdsCache::new(DEFAULT_MAX_HANDLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cache_evicts_half_in_insertion_order() {
        let mut cache: VdsCache<u32> = VdsCache::new(4);
        for (i, h) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.insert(h, i as u32);
        }
        assert_eq!(cache.len(), 4);

        cache.insert("e", 99);
        // a and b evicted, c and d retained, e added
        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(&2));
        assert_eq!(cache.get("e"), Some(&99));
    }

    #[test]
    fn explicit_removal() {
        let mut cache: VdsCache<&str> = VdsCache::new(8);
        cache.insert("h1", "one");
        cache.insert("h2", "two");

        assert_eq!(cache.remove("h1"), Some("one"));
        assert!(cache.get("h1").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_replaces_without_eviction() {
        let mut cache: VdsCache<u32> = VdsCache::new(2);
        cache.insert("h", 1);
        cache.insert("h", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("h"), Some(&2));
    }
}
