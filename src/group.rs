//! Provides cache groups - the named, isolated cache spaces of the system.
//!
//! A **group** pairs one byte-budgeted cache with one loader: callers ask the group for a key,
//! the group serves it from its cache or - on a miss - obtains the value and populates the
//! cache. All groups of a process live in a [Registry] which is created at process start (by
//! the [Builder](crate::builder::Builder)) and reached through the
//! [Platform](crate::platform::Platform), therefore tests can operate on a fresh registry
//! without any global state.
//!
//! The miss path is where the distribution happens: if a [PeerPicker](crate::peers::PeerPicker)
//! is registered and the consistent-hash ring assigns the key to a remote peer, the value is
//! fetched via the HTTP peer protocol instead of being recomputed locally. Loads for one key
//! are coalesced (see [singleflight](crate::singleflight)), so a thundering herd of misses
//! invokes the loader exactly once.
//!
//! # Example
//! ```no_run
//! # use ganymede::group::Registry;
//! # use std::sync::Arc;
//! #[tokio::main]
//! async fn main() {
//!     let registry = Registry::new();
//!
//!     // A loader is any closure (or Loader implementation) which produces the bytes
//!     // for a key which isn't cached yet...
//!     let group = registry.create(
//!         "character_heights",
//!         2 << 10,
//!         Arc::new(|key: &str| -> anyhow::Result<Vec<u8>> {
//!             match key {
//!                 "KeQing" => Ok(b"158.4".to_vec()),
//!                 _ => Err(anyhow::anyhow!("{} not exist", key)),
//!             }
//!         }),
//!     );
//!
//!     // The first lookup invokes the loader, subsequent ones hit the cache.
//!     let height = group.get("KeQing").await.unwrap();
//!     assert_eq!(height.to_string(), "158.4");
//! }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::lru::SharedCache;
use crate::peers::PeerPicker;
use crate::platform::Platform;
use crate::singleflight::FlightGroup;
use crate::value::ByteView;

/// Produces the value for a key which is not present in the cache.
///
/// This is the user-supplied data source of a group (e.g. a database query or an expensive
/// computation). Returning an error signals that there is no value for the given key; the
/// error is propagated to the caller verbatim and the cache is left unpopulated.
///
/// Any plain closure of the shape `Fn(&str) -> anyhow::Result<Vec<u8>>` can be used as a
/// loader directly. Implement the trait itself if the load has to await something.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the value for the given key from the underlying data source.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
impl<F> Loader for F
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self(key)
    }
}

/// Represents a named cache space with a fixed byte budget and a loader.
///
/// Groups are created via [Registry::create] and handed around as `Arc<Group>`. All operations
/// take `&self`, therefore a group can be shared freely between the peer server and any number
/// of in-process callers.
pub struct Group {
    name: String,
    cache: SharedCache,
    loader: Arc<dyn Loader>,
    peers: RwLock<Option<Arc<dyn PeerPicker>>>,
    flights: FlightGroup,
}

impl Group {
    /// Returns the name under which this group is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the peer picker to consult before loading a key locally.
    ///
    /// Without a picker, every miss is answered by the local loader. With one, the miss path
    /// first asks the picker whether a remote peer owns the key.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) {
        *self.peers.write().unwrap() = Some(picker);
    }

    /// Returns the value for the given key.
    ///
    /// An empty key is rejected right away (this is a caller error, distinct from "no value
    /// found"). Otherwise the cache is consulted first; on a miss, the value is obtained via
    /// the load path and the cache is populated.
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if key.is_empty() {
            return Err(anyhow::anyhow!("key is required"));
        }

        if let Some(view) = self.cache.get(key) {
            log::debug!("[{}] Cache hit for '{}'...", self.name, key);
            return Ok(view);
        }

        self.load(key).await
    }

    /// Returns the number of entries currently cached by this group.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Determines if this group caches no entries at all.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Returns the number of bytes currently tracked by this group's cache.
    pub fn weight(&self) -> usize {
        self.cache.weight()
    }

    /// Obtains a missing value, coalescing concurrent loads for the same key.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        self.flights.execute(key, || self.fetch(key)).await
    }

    /// Decides where a missing value comes from: a remote peer or the local loader.
    ///
    /// A failing peer fetch falls back to the local loader, favoring availability over
    /// strict ownership.
    async fn fetch(&self, key: &str) -> anyhow::Result<ByteView> {
        let picker = self.peers.read().unwrap().clone();
        if let Some(picker) = picker {
            if let Some(peer) = picker.pick_peer(key) {
                match peer.fetch(&self.name, key).await {
                    Ok(bytes) => return Ok(ByteView::new(&bytes)),
                    Err(error) => {
                        log::warn!(
                            "[{}] Failed to fetch '{}' from its owning peer: {:#}. Loading locally...",
                            self.name,
                            key,
                            error
                        );
                    }
                }
            }
        }

        self.load_locally(key).await
    }

    /// Invokes the loader and populates the cache with its result.
    async fn load_locally(&self, key: &str) -> anyhow::Result<ByteView> {
        let bytes = self.loader.load(key).await?;
        let view = ByteView::new(&bytes);
        self.cache.add(key, view.clone());

        Ok(view)
    }
}

/// Keeps all cache groups of a process, indexed by their unique name.
///
/// Registration takes the write side of the lock, lookups the read side - lookups therefore
/// never block each other and group names are the only way external code (most notably the
/// peer server) reaches a group.
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Registry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Registry {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry and registers it in the given platform.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) during setup.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        platform.register::<Registry>(registry.clone());

        registry
    }

    /// Creates a group with the given name, byte capacity and loader and registers it.
    ///
    /// A capacity of 0 leaves the cache unbounded. Registering a name twice replaces the
    /// previous group. Note that a group without a loader cannot be constructed at all, as
    /// the signature demands one.
    pub fn create(&self, name: &str, capacity: usize, loader: Arc<dyn Loader>) -> Arc<Group> {
        let group = Arc::new(Group {
            name: name.to_owned(),
            cache: SharedCache::new(capacity),
            loader,
            peers: RwLock::new(None),
            flights: FlightGroup::new(),
        });

        let _ = self
            .groups
            .write()
            .unwrap()
            .insert(name.to_owned(), group.clone());
        log::info!(
            "Created cache group '{}' with a budget of {}.",
            name,
            crate::fmt::format_size(capacity)
        );

        group
    }

    /// Returns the group registered under the given name, if there is one.
    pub fn find(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Returns the names of all registered groups.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().unwrap().keys().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::group::{Loader, Registry};
    use crate::peers::{PeerClient, PeerPicker};
    use crate::testing::test_async;

    fn test_db() -> HashMap<String, String> {
        let mut db = HashMap::new();
        let _ = db.insert("ShenZi".to_owned(), "169.5".to_owned());
        let _ = db.insert("NingGuang".to_owned(), "169.5".to_owned());
        let _ = db.insert("KeQing".to_owned(), "158.4".to_owned());
        db
    }

    #[test]
    fn loaded_values_are_cached() {
        test_async(async {
            let registry = Registry::new();
            let db = test_db();
            let load_counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

            let counted_loads = load_counts.clone();
            let group = registry.create(
                "character_heights",
                2 << 10,
                Arc::new(move |key: &str| -> anyhow::Result<Vec<u8>> {
                    *counted_loads.lock().unwrap().entry(key.to_owned()).or_insert(0) += 1;
                    match db.get(key) {
                        Some(value) => Ok(value.clone().into_bytes()),
                        None => Err(anyhow::anyhow!("{} not exist", key)),
                    }
                }),
            );

            for (key, value) in test_db() {
                // The first lookup goes through the loader...
                assert_eq!(group.get(&key).await.unwrap().to_string(), value);
                // ...the second one is answered by the cache.
                assert_eq!(group.get(&key).await.unwrap().to_string(), value);
                assert_eq!(load_counts.lock().unwrap()[&key], 1);
            }
        });
    }

    #[test]
    fn an_empty_key_is_rejected() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create(
                "test",
                1024,
                Arc::new(|key: &str| -> anyhow::Result<Vec<u8>> { Ok(key.as_bytes().to_vec()) }),
            );

            let error = group.get("").await.unwrap_err();
            assert_eq!(error.to_string(), "key is required");
        });
    }

    #[test]
    fn loader_errors_do_not_populate_the_cache() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create(
                "test",
                1024,
                Arc::new(|key: &str| -> anyhow::Result<Vec<u8>> {
                    Err(anyhow::anyhow!("{} not exist", key))
                }),
            );

            let error = group.get("unknown").await.unwrap_err();
            assert_eq!(error.to_string(), "unknown not exist");
            assert_eq!(group.len(), 0);
        });
    }

    #[test]
    fn groups_are_found_by_name() {
        let registry = Registry::new();
        let _ = registry.create(
            "known",
            1024,
            Arc::new(|key: &str| -> anyhow::Result<Vec<u8>> { Ok(key.as_bytes().to_vec()) }),
        );

        assert_eq!(registry.find("known").unwrap().name(), "known");
        assert!(registry.find("known111").is_none());
    }

    /// A loader which takes a while, so that concurrent misses actually overlap.
    struct SlowLoader {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl Loader for SlowLoader {
        async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(key.as_bytes().to_vec())
        }
    }

    #[test]
    fn concurrent_misses_invoke_the_loader_once() {
        test_async(async {
            let registry = Registry::new();
            let loader = Arc::new(SlowLoader {
                invocations: AtomicUsize::new(0),
            });
            let group = registry.create("test", 1024, loader.clone());

            let (first, second, third) =
                tokio::join!(group.get("key"), group.get("key"), group.get("key"));

            assert_eq!(loader.invocations.load(Ordering::SeqCst), 1);
            assert_eq!(first.unwrap().to_string(), "key");
            assert_eq!(second.unwrap().to_string(), "key");
            assert_eq!(third.unwrap().to_string(), "key");
        });
    }

    /// A peer client which serves every key from a fixed remote "database".
    struct TestPeerClient {
        fetches: AtomicUsize,
        fails: bool,
    }

    #[async_trait]
    impl PeerClient for TestPeerClient {
        async fn fetch(&self, _group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                Err(anyhow::anyhow!("peer is down"))
            } else {
                Ok(format!("remote:{}", key).into_bytes())
            }
        }
    }

    /// A picker which routes every key to its single test peer.
    struct TestPeerPicker {
        client: Arc<TestPeerClient>,
    }

    impl PeerPicker for TestPeerPicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerClient>> {
            Some(self.client.clone())
        }
    }

    #[test]
    fn remote_owners_are_consulted_before_the_local_loader() {
        test_async(async {
            let registry = Registry::new();
            let local_loads = Arc::new(AtomicUsize::new(0));

            let counted = local_loads.clone();
            let group = registry.create(
                "test",
                1024,
                Arc::new(move |key: &str| -> anyhow::Result<Vec<u8>> {
                    let _ = counted.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("local:{}", key).into_bytes())
                }),
            );

            let client = Arc::new(TestPeerClient {
                fetches: AtomicUsize::new(0),
                fails: false,
            });
            group.register_peers(Arc::new(TestPeerPicker {
                client: client.clone(),
            }));

            let value = group.get("key").await.unwrap();
            assert_eq!(value.to_string(), "remote:key");
            assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
            assert_eq!(local_loads.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn a_failing_peer_falls_back_to_the_local_loader() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create(
                "test",
                1024,
                Arc::new(|key: &str| -> anyhow::Result<Vec<u8>> {
                    Ok(format!("local:{}", key).into_bytes())
                }),
            );

            let client = Arc::new(TestPeerClient {
                fetches: AtomicUsize::new(0),
                fails: true,
            });
            group.register_peers(Arc::new(TestPeerPicker {
                client: client.clone(),
            }));

            let value = group.get("key").await.unwrap();
            assert_eq!(value.to_string(), "local:key");
            assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
        });
    }
}
