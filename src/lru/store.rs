use linked_hash_map::LinkedHashMap;

use crate::value::ByteSize;

/// Invoked with the key and value of an entry which has been evicted.
pub type EvictionListener<V> = Box<dyn FnMut(String, V) + Send>;

/// Provides a byte-budgeted LRU store for string keys.
///
/// The store behaves just like a **Map** as long as its byte budget permits. Once the total
/// weight (the length of each key plus the reported size of its value) exceeds the configured
/// capacity, the least recently used entries are evicted until the budget is honored again.
/// A capacity of 0 disables the budget entirely.
///
/// Measuring the capacity in bytes rather than in entries bounds the actual memory footprint
/// of a cache instead of an arbitrary item count.
///
/// Note that this structure is not safe for unsynchronized concurrent use. Concurrent callers
/// have to go through [SharedCache](crate::lru::SharedCache) which serializes all operations.
///
/// # Examples
/// ```
/// # use ganymede::lru::LruStore;
/// # use ganymede::value::ByteView;
/// // Provides a budget of 8 bytes...
/// let mut lru = LruStore::new(8);
///
/// lru.add("k1".to_owned(), ByteView::new(b"v1"));
/// lru.add("k2".to_owned(), ByteView::new(b"v2"));
/// assert_eq!(lru.len(), 2);
///
/// // ...which is fully used up by the two entries above. Adding a third one
/// // therefore drops the least recently used entry.
/// lru.add("k3".to_owned(), ByteView::new(b"v3"));
/// assert_eq!(lru.len(), 2);
/// assert_eq!(lru.get("k1"), None);
/// assert_eq!(lru.get("k3"), Some(&ByteView::new(b"v3")));
/// ```
pub struct LruStore<V: ByteSize> {
    capacity: usize,
    weight: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, Entry<V>>,
    on_evict: Option<EvictionListener<V>>,
}

struct Entry<V: ByteSize> {
    weight: usize,
    value: V,
}

impl<V: ByteSize> LruStore<V> {
    /// Creates a new store with the given byte capacity.
    ///
    /// A capacity of 0 indicates that no budget at all should be enforced.
    pub fn new(capacity: usize) -> Self {
        LruStore {
            capacity,
            weight: 0,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
            on_evict: None,
        }
    }

    /// Creates a new store which invokes the given listener for each evicted entry.
    ///
    /// The listener receives the key and the value being dropped. It is only invoked for
    /// capacity driven evictions, not when an entry is replaced by [add](LruStore::add).
    ///
    /// # Examples
    /// ```
    /// # use ganymede::lru::LruStore;
    /// # use ganymede::value::ByteView;
    /// # use std::sync::{Arc, Mutex};
    /// let evicted = Arc::new(Mutex::new(Vec::new()));
    /// let listener_log = evicted.clone();
    ///
    /// let mut lru = LruStore::with_eviction_listener(6, move |key, _value: ByteView| {
    ///     listener_log.lock().unwrap().push(key);
    /// });
    ///
    /// lru.add("k1".to_owned(), ByteView::new(b"v1"));
    /// lru.add("k2".to_owned(), ByteView::new(b"v2"));
    /// assert_eq!(evicted.lock().unwrap().as_slice(), &["k1".to_owned()]);
    /// ```
    pub fn with_eviction_listener(
        capacity: usize,
        listener: impl FnMut(String, V) + Send + 'static,
    ) -> Self {
        LruStore {
            capacity,
            weight: 0,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
            on_evict: Some(Box::new(listener)),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced, the entry is promoted to the most
    /// recently used position and the tracked weight is adjusted by the size difference of the
    /// two values. Otherwise a new entry is appended at the most recently used end.
    ///
    /// Afterwards, entries are evicted (oldest first) until the tracked weight no longer
    /// exceeds a nonzero capacity. Note that this never fails: an entry which is larger than
    /// the whole budget simply flushes the store, including itself.
    pub fn add(&mut self, key: String, value: V) {
        let entry_weight = key.len() + value.allocated_size();
        self.writes += 1;

        if let Some(entry) = self.map.get_refresh(key.as_str()) {
            self.weight = (self.weight + entry_weight) - entry.weight;
            entry.weight = entry_weight;
            entry.value = value;
        } else {
            let _ = self.map.insert(
                key,
                Entry {
                    weight: entry_weight,
                    value,
                },
            );
            self.weight += entry_weight;
        }

        while self.capacity != 0 && self.weight > self.capacity {
            self.remove_oldest();
        }
    }

    /// Returns the value stored for the given key or **None** if no value is present.
    ///
    /// A successful lookup promotes the entry to the most recently used position. Reads are
    /// therefore deliberately not read-only with respect to the eviction order.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        match self.map.get_refresh(key) {
            Some(entry) => {
                self.hits += 1;
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Evicts the least recently used entry.
    ///
    /// This detaches the entry from the recency order, removes it from the lookup table,
    /// releases its tracked weight and finally hands it to the eviction listener (if one is
    /// registered). Does nothing if the store is empty.
    pub fn remove_oldest(&mut self) {
        if let Some((key, entry)) = self.map.pop_front() {
            self.weight -= entry.weight;
            if let Some(listener) = &mut self.on_evict {
                listener(key, entry.value);
            }
        }
    }

    /// Returns the number of entries currently being stored.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the total tracked weight (key and value bytes) in this store.
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Returns the configured byte capacity (0 = unlimited).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the total number of reads performed on this store.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the total number of writes performed on this store.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the number of reads which were answered from the store.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::lru::LruStore;
    use crate::value::{ByteSize, ByteView};

    #[test]
    fn present_and_absent_keys_are_reported() {
        let mut lru = LruStore::new(128);
        lru.add("k1".to_owned(), ByteView::new(b"v1"));

        assert_eq!(lru.get("k1"), Some(&ByteView::new(b"v1")));
        assert_eq!(lru.get("k2"), None);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.weight(), 4);
    }

    #[test]
    fn the_byte_budget_is_enforced() {
        // The budget exactly fits "k1"+"v1" and "k2"+"v2"...
        let capacity = "k1".len() + "k2".len() + "v1".len() + "v2".len();
        let mut lru = LruStore::new(capacity);

        lru.add("k1".to_owned(), ByteView::new(b"v1"));
        lru.add("k2".to_owned(), ByteView::new(b"v2"));
        lru.add("k3".to_owned(), ByteView::new(b"v3"));

        // ...therefore adding a third entry drops the least recently used one.
        assert_eq!(lru.get("k1"), None);
        assert_eq!(lru.len(), 2);
        assert!(lru.weight() <= capacity);
    }

    #[test]
    fn reads_protect_entries_from_eviction() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let listener_log = evicted.clone();

        let mut lru = LruStore::with_eviction_listener(10, move |key, _value: ByteView| {
            listener_log.lock().unwrap().push(key);
        });

        lru.add("k1".to_owned(), ByteView::new(b"v1"));
        lru.add("k2".to_owned(), ByteView::new(b"v2"));
        let _ = lru.get("k1");
        lru.add("k3".to_owned(), ByteView::new(b"v3"));
        let _ = lru.get("k1");
        lru.add("k4".to_owned(), ByteView::new(b"v4"));

        // "k1" was touched before each eviction point and therefore survived both rounds...
        assert_eq!(
            evicted.lock().unwrap().as_slice(),
            &["k2".to_owned(), "k3".to_owned()]
        );
        assert_eq!(lru.get("k1"), Some(&ByteView::new(b"v1")));
    }

    #[test]
    fn replacing_a_value_adjusts_the_weight() {
        let mut lru = LruStore::new(0);

        lru.add("key".to_owned(), ByteView::new(b"tiny"));
        assert_eq!(lru.weight(), 7);

        lru.add("key".to_owned(), ByteView::new(b"a way larger value"));
        assert_eq!(lru.weight(), 21);
        assert_eq!(lru.len(), 1);

        lru.add("key".to_owned(), ByteView::new(b""));
        assert_eq!(lru.weight(), 3);
    }

    #[test]
    fn a_zero_capacity_disables_the_budget() {
        let mut lru = LruStore::new(0);

        for index in 0..1000 {
            lru.add(format!("key-{}", index), ByteView::new(b"some payload"));
        }

        assert_eq!(lru.len(), 1000);
    }

    #[test]
    fn an_oversized_entry_flushes_the_store() {
        let mut lru = LruStore::new(8);

        lru.add("k1".to_owned(), ByteView::new(b"v1"));
        lru.add("huge".to_owned(), ByteView::new(b"way beyond the budget"));

        // Even the oversized entry itself is dropped, as the budget can never be honored
        // while it is present...
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.weight(), 0);
    }

    #[test]
    fn removing_from_an_empty_store_is_harmless() {
        let mut lru: LruStore<ByteView> = LruStore::new(16);
        lru.remove_oldest();

        assert_eq!(lru.len(), 0);
        assert_eq!(lru.weight(), 0);
    }

    #[test]
    fn any_byte_sized_value_can_be_stored() {
        let value = String::from("169.5");
        let expected_weight = "ShenZi".len() + value.allocated_size();

        // The store is generic over the value type, plain strings work just as well as
        // byte views and are weighted by their heap allocation...
        let mut lru = LruStore::new(64);
        lru.add("ShenZi".to_owned(), value);

        assert_eq!(lru.weight(), expected_weight);
        assert_eq!(lru.get("ShenZi").map(String::as_str), Some("169.5"));
    }

    #[test]
    fn metrics_are_tracked() {
        let mut lru = LruStore::new(128);

        lru.add("k1".to_owned(), ByteView::new(b"v1"));
        let _ = lru.get("k1");
        let _ = lru.get("k1");
        let _ = lru.get("unknown");
        let _ = lru.get("other");

        assert_eq!(lru.writes(), 1);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hits(), 2);
        assert_eq!(lru.hit_rate().round() as i32, 50);
    }
}
