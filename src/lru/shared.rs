use std::sync::Mutex;

use crate::lru::store::LruStore;
use crate::value::ByteView;

/// Makes a single [LruStore] safe for concurrent callers.
///
/// Exactly one mutex guards the whole store, therefore every operation (including the recency
/// promotion performed by reads) is serialized. As each cache group owns its own instance,
/// operations on different groups never contend with each other.
///
/// The backing store is created lazily on the first write: a group with a configured capacity
/// but no writes yet costs no backing allocation, and a read on a never-written cache is a
/// safe miss rather than an error.
pub struct SharedCache {
    capacity: usize,
    store: Mutex<Option<LruStore<ByteView>>>,
}

impl SharedCache {
    /// Creates a new cache with the given byte capacity (0 = unlimited).
    pub fn new(capacity: usize) -> Self {
        SharedCache {
            capacity,
            store: Mutex::new(None),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// See [LruStore::add] for the eviction semantics being applied.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut store = self.store.lock().unwrap();
        store
            .get_or_insert_with(|| LruStore::new(self.capacity))
            .add(key.to_owned(), value);
    }

    /// Returns the value stored for the given key or **None** if no value is present.
    ///
    /// A hit promotes the entry and hands out a cheap clone of the stored view.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut store = self.store.lock().unwrap();
        store.as_mut().and_then(|store| store.get(key).cloned())
    }

    /// Returns the number of entries currently being cached.
    pub fn len(&self) -> usize {
        let store = self.store.lock().unwrap();
        store.as_ref().map(|store| store.len()).unwrap_or(0)
    }

    /// Determines if the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total tracked weight in bytes (0 if never written).
    pub fn weight(&self) -> usize {
        let store = self.store.lock().unwrap();
        store.as_ref().map(|store| store.weight()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::lru::SharedCache;
    use crate::value::ByteView;

    #[test]
    fn reading_an_untouched_cache_is_a_safe_miss() {
        let cache = SharedCache::new(1024);

        assert_eq!(cache.get("anything"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn values_survive_a_round_trip() {
        let cache = SharedCache::new(1024);
        cache.add("key", ByteView::new(b"value"));

        assert_eq!(cache.get("key"), Some(ByteView::new(b"value")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_and_readers_are_serialized() {
        let cache = Arc::new(SharedCache::new(0));
        let mut threads = Vec::new();

        for worker in 0..4 {
            let cache = cache.clone();
            threads.push(std::thread::spawn(move || {
                for index in 0..100 {
                    let key = format!("{}-{}", worker, index);
                    cache.add(&key, ByteView::new(key.as_bytes()));
                    assert_eq!(cache.get(&key), Some(ByteView::new(key.as_bytes())));
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
    }
}
