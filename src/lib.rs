//! Ganymede is a library for sharing expensive-to-compute values between processes as a
//! distributed, in-process cache.
//!
//! # Introduction
//! **Ganymede** keeps computed values in byte-budgeted LRU caches, loads missing values
//! through a user-supplied loader and exposes its caches over HTTP so that peer processes can
//! fetch values instead of recomputing them. A consistent-hash ring decides which process owns
//! which key, therefore each value is computed (and primarily cached) on exactly one node of
//! the cluster.
//!
//! Caches are organized in named **groups**: each group pairs one cache with one loader and
//! one byte budget, so that e.g. thumbnail data and database lookups never evict each other.
//! Within a group, concurrent misses for one key are coalesced into a single load, which
//! keeps thundering herds away from the underlying data source.
//!
//! # Features
//! * **Byte-budgeted LRU caches** - the budget counts the actual bytes of keys and values,
//!   not the number of entries, therefore it bounds the real memory footprint of a cache.
//! * **Consistent-hash key ownership** - peers are placed on a hash ring with virtual nodes,
//!   so only a small fraction of keys moves when the cluster topology changes.
//! * **Miss deduplication** - a thundering herd of lookups for one missing key invokes the
//!   loader exactly once, all other callers share the outcome.
//! * **100% Async/Await** - the whole server builds upon [tokio](https://tokio.rs/) and
//!   async/await primitives as provided by Rust.
//! * **Reload-aware config facility** which permits to update the configuration during
//!   operation. Therefore, no restart is ever required, even when changing the IP binding or
//!   port. This is kind of important for a caching application which might have an expensive
//!   warm-up time.
//!
//! # Modules
//! * **group**: Cache groups and the process-wide [Registry](group::Registry). This is the
//!   main user-facing API. More infos: [crate::group]
//! * **lru**: The byte-budgeted LRU store and its concurrency-safe wrapper. See [crate::lru]
//! * **ring**: The consistent-hash ring assigning keys to peers. See [crate::ring]
//! * **peers**: Peer picking and the HTTP peer client. See [crate::peers]
//! * **server**: The peer-facing HTTP server answering `GET {base}/{group}/{key}`. See
//!   [crate::server]
//!
//! # Example
//! A short example on how to initialize the library can be found here
//! [Builder](builder::Builder).
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod fmt;
pub mod group;
pub mod lru;
pub mod peers;
pub mod platform;
pub mod ring;
pub mod server;
pub mod signals;
pub mod singleflight;
pub mod value;

/// Contains the version of the Ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
