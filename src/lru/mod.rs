//! Provides a size constrained LRU store along with its concurrency-safe wrapper.
//!
//! An LRU store drops the least recently used entry once it is about to grow beyond its byte
//! budget. In contrast to caches which limit the number of entries, the budget here is measured
//! in bytes of key and value data, therefore it bounds the actual memory footprint of a cache.
//!
//! [LruStore] is the bare, single-threaded data structure. It is generic over any value type
//! implementing [ByteSize](crate::value::ByteSize) and is deliberately not safe for concurrent
//! use - all synchronization is the job of [SharedCache], which guards one store instance with
//! a single mutex and creates it lazily on the first write. Each cache group owns one
//! **SharedCache**, therefore different groups never contend for the same lock.
mod shared;
mod store;

pub use shared::SharedCache;
pub use store::{EvictionListener, LruStore};
