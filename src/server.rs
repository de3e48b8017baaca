//! Contains the peer-facing HTTP server of Ganymede.
//!
//! Opens a server socket on the specified port (**server.port** in the config or 9190 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Peers fetch cached values via `GET {base_path}{group}/{key}` where the base path
//! defaults to **/_cache/** (**server.base_path** in the config).
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port, therefore a "new" instance
//! can be started and the "old" one can bleed out and the port will be "handed through" with
//! minimal downtime. Also, this will listen to change events of the config and will relocate
//! to another port or host if changed.
//!
//! # Request contract
//!
//! * a path without the base prefix or without both a group and a key segment yields **400**
//! * an unknown group yields **404**
//! * a failing load yields **500** carrying the error text
//! * a successful load yields **200** with **application/octet-stream** content
//!
//! # Example
//!
//! ```no_run
//! use ganymede::builder::Builder;
//! use ganymede::config::Config;
//! use ganymede::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     //  Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None);
//!
//!     // Run the platform...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use percent_encoding::percent_decode_str;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};

use crate::config::Config;
use crate::group::Registry;
use crate::peers::DEFAULT_BASE_PATH;
use crate::platform::Platform;
use crate::spawn;

/// Specifies the interval in which the graceful shutdown future re-checks whether the
/// platform or the server socket is still supposed to run.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Represents the HTTP server which answers peer cache lookups.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of the
    /// server. Rather we toggle this flag to false if a config and therefore address change was
    /// detected. This way the running socket is shut down gracefully and a new server socket
    /// for the appropriate address will be setup by the **event_loop**.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default we
    /// use port 9190 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.query("server.host").as_str().unwrap_or("0.0.0.0"),
                    handle
                        .query("server.port")
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(9190)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:9190".to_owned())
    }

    /// Determines the base path under which the peer protocol is served.
    fn base_path(&self) -> String {
        self.platform
            .find::<Config>()
            .and_then(|config| {
                config
                    .current()
                    .query("server.base_path")
                    .as_str()
                    .map(|path| path.to_owned())
            })
            .unwrap_or_else(|| DEFAULT_BASE_PATH.to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve peer lookups.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, the socket serves requests until either the platform is terminated (then
    /// we exit) or the config has changed (then we re-bind the server to the new address).
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            if let Err(error) = self.serve(&address).await {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open server address {}: {}. Retrying every 500ms...",
                        &address,
                        error
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Binds the server socket and serves requests until a shutdown is requested.
    async fn serve(&self, address: &str) -> anyhow::Result<()> {
        let socket_address = address
            .parse::<SocketAddr>()
            .context("Invalid server address")?;

        let registry = self.platform.require::<Registry>();
        let base_path = self.base_path();

        let make_service = make_service_fn(move |_| {
            let registry = registry.clone();
            let base_path = base_path.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let registry = registry.clone();
                    let base_path = base_path.clone();
                    async move {
                        Ok::<_, Infallible>(dispatch(registry, &base_path, request).await)
                    }
                }))
            }
        });

        let server = hyper::Server::try_bind(&socket_address)
            .context("Failed to bind the server socket")?
            .serve(make_service);

        log::info!("Opened server socket on {}...", address);
        *self.current_address.lock().unwrap() = Some(address.to_owned());

        let result = server
            .with_graceful_shutdown(self.await_shutdown())
            .await
            .context("The server socket failed");

        log::info!("Closing server socket on {}.", address);

        result
    }

    /// Completes once the running socket should be closed.
    ///
    /// This either happens because the platform is being terminated or because a config change
    /// moved the server to another address. In the latter case the **running** flag is toggled
    /// to false so that the event loop re-binds the socket.
    async fn await_shutdown(&self) {
        let mut config_changed_flag = self
            .platform
            .find::<Config>()
            .map(|config| config.notifier());

        while self.platform.is_running() && self.is_running() {
            match config_changed_flag.as_mut() {
                Some(notifier) => {
                    tokio::select! {
                        _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
                        changed = notifier.recv() => {
                            if changed.is_ok() {
                                // If the config was changed, we need to check if the address
                                // itself changed...
                                let new_address = self.address();
                                if self.current_address.lock().unwrap().as_ref() != Some(&new_address) {
                                    log::info!("Server address has changed. Restarting server socket...");

                                    // Force the event_loop to re-evaluate the expected server
                                    // address...
                                    self.running.store(false, Ordering::Release);
                                }
                            }
                        }
                    }
                }
                None => tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await,
            }
        }
    }
}

/// Routes a single peer request to the appropriate cache group.
///
/// Note that the request method is deliberately ignored, the peer protocol only consists of
/// lookups and transmits all parameters within the path.
async fn dispatch(
    registry: Arc<Registry>,
    base_path: &str,
    request: Request<Body>,
) -> Response<Body> {
    let path = request.uri().path().to_owned();
    log::debug!("Received peer request for {}...", path);

    let route = match path.strip_prefix(base_path) {
        Some(route) => route,
        None => {
            return status_response(
                StatusCode::BAD_REQUEST,
                format!("Expected a path starting with {}.", base_path),
            );
        }
    };

    let mut segments = route.splitn(2, '/');
    let group_name = segments.next().unwrap_or("");
    let key = segments.next().unwrap_or("");
    if group_name.is_empty() || key.is_empty() {
        return status_response(
            StatusCode::BAD_REQUEST,
            format!("Expected a path of the form {}{{group}}/{{key}}.", base_path),
        );
    }

    // The peer client percent-encodes both segments, therefore they have to be decoded here
    // (after splitting, so an encoded '/' stays within its segment)...
    let (group_name, key) = match (
        percent_decode_str(group_name).decode_utf8(),
        percent_decode_str(key).decode_utf8(),
    ) {
        (Ok(group_name), Ok(key)) => (group_name, key),
        _ => {
            return status_response(
                StatusCode::BAD_REQUEST,
                "Expected valid percent-encoded UTF-8 path segments.".to_owned(),
            );
        }
    };

    let group = match registry.find(&group_name) {
        Some(group) => group,
        None => {
            return status_response(
                StatusCode::NOT_FOUND,
                format!("no such group: {}", group_name),
            );
        }
    };

    match group.get(&key).await {
        Ok(view) => {
            let mut response = Response::new(Body::from(view.byte_slice()));
            let _ = response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );

            response
        }
        Err(error) => status_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", error),
        ),
    }
}

/// Creates a plain text response with the given status code.
fn status_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    let _ = response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    response
}
