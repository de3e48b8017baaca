//! Distributes key ownership over a set of peer processes.
//!
//! Every process of a cluster runs the same groups and announces the same peer list. The
//! [HttpPeers] picker places all peer base URLs on a consistent-hash ring
//! (see [ring](crate::ring)); a group consults the picker on every cache miss and - if the
//! ring assigns the key to a remote peer - fetches the value via the HTTP peer protocol
//! instead of recomputing it locally. If the ring resolves to the process itself (or no peers
//! are configured at all), the miss is answered by the local loader.
//!
//! The two capabilities are deliberately small traits, therefore tests can inject their own
//! pickers and clients without any HTTP involved.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use hyper::{Body, Client, Uri};
use hyper_tls::HttpsConnector;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::ring::HashRing;

/// The characters to escape when placing a group name or key into a URL path segment.
///
/// Besides everything a URL forbids outright, this covers '/' (which would split the key into
/// additional path segments) and '%' (so that encoded keys always decode back verbatim).
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// The default number of virtual nodes each peer occupies on the ring.
pub const DEFAULT_REPLICAS: usize = 64;

/// The default base path under which the peer protocol is served.
pub const DEFAULT_BASE_PATH: &str = "/_cache/";

/// Decides which peer owns a given cache key.
pub trait PeerPicker: Send + Sync {
    /// Returns the client for the peer owning the given key.
    ///
    /// Returns **None** if the key is owned by this process itself (or if no peers are known),
    /// in which case the caller has to load the value locally.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>>;
}

/// Fetches a cached value from a single remote peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetches the value for the given group and key from the remote peer.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// The state being swapped atomically whenever the peer topology changes.
struct Topology {
    ring: HashRing,
    clients: HashMap<String, Arc<HttpPeerClient>>,
}

/// Picks peers by placing their base URLs on a consistent-hash ring.
///
/// The picker is constructed with the URL under which this process itself is reachable, so
/// that keys owned by the local process are recognized and loaded locally. Topology changes
/// are applied via [set_peers](HttpPeers::set_peers), which rebuilds the ring - node removal
/// therefore never has to be expressed on the ring itself.
///
/// # Examples
/// ```
/// # use ganymede::peers::HttpPeers;
/// let peers = HttpPeers::new("http://cache-1:9190");
/// peers.set_peers(&[
///     "http://cache-1:9190".to_owned(),
///     "http://cache-2:9190".to_owned(),
///     "http://cache-3:9190".to_owned(),
/// ]);
/// ```
pub struct HttpPeers {
    self_url: String,
    base_path: String,
    replicas: usize,
    topology: RwLock<Topology>,
}

impl HttpPeers {
    /// Creates a new picker for the process reachable under the given base URL.
    ///
    /// Uses [DEFAULT_REPLICAS] virtual nodes per peer and [DEFAULT_BASE_PATH] as protocol
    /// prefix.
    pub fn new(self_url: &str) -> Self {
        Self::with_settings(self_url, DEFAULT_BASE_PATH, DEFAULT_REPLICAS)
    }

    /// Creates a new picker with a custom base path and virtual node count.
    pub fn with_settings(self_url: &str, base_path: &str, replicas: usize) -> Self {
        HttpPeers {
            self_url: self_url.trim_end_matches('/').to_owned(),
            base_path: base_path.to_owned(),
            replicas,
            topology: RwLock::new(Topology {
                ring: HashRing::new(replicas),
                clients: HashMap::new(),
            }),
        }
    }

    /// Replaces the set of known peers (normally including this process itself).
    ///
    /// This rebuilds the hash ring and the per-peer HTTP clients from scratch, therefore it
    /// handles joining and leaving peers alike.
    pub fn set_peers(&self, peers: &[String]) {
        let mut ring = HashRing::new(self.replicas);
        let mut clients = HashMap::new();

        for peer in peers {
            let peer = peer.trim_end_matches('/').to_owned();
            ring.add([peer.as_str()]);
            if peer != self.self_url {
                let base = format!("{}{}", peer, self.base_path);
                let _ = clients.insert(peer, Arc::new(HttpPeerClient::new(&base)));
            }
        }

        log::info!(
            "Peer topology of {} updated: {} peer(s) on the ring.",
            self.self_url,
            peers.len()
        );

        *self.topology.write().unwrap() = Topology { ring, clients };
    }
}

impl PeerPicker for HttpPeers {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>> {
        let topology = self.topology.read().unwrap();
        let owner = topology.ring.get(key)?;
        if owner == self.self_url {
            return None;
        }

        topology
            .clients
            .get(owner)
            .map(|client| -> Arc<dyn PeerClient> { client.clone() })
    }
}

/// Fetches values from one remote peer via `GET {base}{group}/{key}`.
pub struct HttpPeerClient {
    base: String,
}

impl HttpPeerClient {
    /// Creates a client for the peer protocol endpoint with the given base URL
    /// (e.g. `http://cache-2:9190/_cache/`).
    pub fn new(base: &str) -> Self {
        HttpPeerClient {
            base: base.to_owned(),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{}{}/{}",
            self.base,
            utf8_percent_encode(group, PATH_SEGMENT),
            utf8_percent_encode(key, PATH_SEGMENT)
        );
        let uri = Uri::from_str(&url).context("Invalid peer url")?;

        let response = if url.starts_with("https") {
            let https = HttpsConnector::new();
            let client = Client::builder().build::<_, Body>(https);
            client
                .get(uri)
                .await
                .context("Failed to query the peer")?
        } else {
            let client = Client::new();
            client
                .get(uri)
                .await
                .context("Failed to query the peer")?
        };

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read the peer response")?;

        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "Peer {} responded with {}: {}",
                url,
                status,
                String::from_utf8_lossy(&body).trim()
            ));
        }

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use crate::peers::{HttpPeers, PeerPicker};

    #[test]
    fn a_single_peer_owns_everything_itself() {
        let peers = HttpPeers::new("http://localhost:9190");
        peers.set_peers(&["http://localhost:9190".to_owned()]);

        for index in 0..64 {
            assert!(peers.pick_peer(&format!("key-{}", index)).is_none());
        }
    }

    #[test]
    fn an_empty_topology_loads_locally() {
        let peers = HttpPeers::new("http://localhost:9190");
        assert!(peers.pick_peer("anything").is_none());
    }

    #[test]
    fn remote_keys_are_routed_to_a_peer() {
        let peers = HttpPeers::new("http://localhost:9190");
        peers.set_peers(&[
            "http://localhost:9190".to_owned(),
            "http://localhost:9191".to_owned(),
            "http://localhost:9192".to_owned(),
        ]);

        // With three evenly replicated peers, some of these keys must be remote...
        let remote = (0..64)
            .filter(|index| peers.pick_peer(&format!("key-{}", index)).is_some())
            .count();

        assert!(remote > 0);
        assert!(remote < 64);
    }

    #[test]
    fn trailing_slashes_do_not_split_the_ring() {
        let peers = HttpPeers::new("http://localhost:9190/");
        peers.set_peers(&["http://localhost:9190".to_owned()]);

        assert!(peers.pick_peer("key").is_none());
    }
}
