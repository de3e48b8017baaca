//! Coalesces concurrent loads for the same cache key into a single execution.
//!
//! Without coalescing, two concurrent misses for one key would both invoke the (potentially
//! expensive) loader and both write the result, the second write overwriting the first. A
//! [FlightGroup] prevents this: the first caller for a key becomes the leader and actually
//! performs the load, all callers arriving while that load is in flight simply await the
//! leader's outcome. The granularity is per key, not per group, therefore loads for different
//! keys never wait on each other.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, Mutex};

use crate::value::ByteView;

/// The outcome shared with all waiters of a flight.
///
/// Errors are shared as plain messages, as the underlying error itself cannot be cloned into
/// each waiter. The message is preserved verbatim.
type FlightResult = Result<ByteView, String>;

/// Represents one in-flight load.
///
/// The id discriminates a flight from a successor for the same key, so that stale entries are
/// never removed by accident.
struct Flight {
    id: u64,
    tx: broadcast::Sender<FlightResult>,
}

/// Tracks all in-flight loads of one cache group, keyed by cache key.
pub struct FlightGroup {
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl FlightGroup {
    /// Creates a new, empty flight table.
    pub fn new() -> Self {
        FlightGroup {
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given load operation, unless one for the same key is already in flight.
    ///
    /// The first caller for a key runs the operation and publishes its outcome; every
    /// concurrent caller for the same key awaits that shared outcome without invoking its own
    /// operation. Once the flight has completed, the next caller starts a fresh one.
    ///
    /// The leader propagates the original error, waiters receive the same message re-wrapped.
    pub async fn execute<F, Fut>(&self, key: &str, load: F) -> anyhow::Result<ByteView>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ByteView>>,
    {
        let mut flights = self.in_flight.lock().await;
        if let Some(flight) = flights.get(key) {
            let id = flight.id;
            let mut rx = flight.tx.subscribe();
            drop(flights);

            return match rx.recv().await {
                Ok(Ok(view)) => Ok(view),
                Ok(Err(message)) => Err(anyhow::anyhow!(message)),
                Err(_) => {
                    // The leader was dropped before publishing a result. Clear the stale
                    // entry (unless a successor took over) so that the next caller retries.
                    let mut flights = self.in_flight.lock().await;
                    if flights.get(key).map(|flight| flight.id) == Some(id) {
                        let _ = flights.remove(key);
                    }

                    Err(anyhow::anyhow!("The load for key '{}' was aborted.", key))
                }
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(1);
        let _ = flights.insert(
            key.to_owned(),
            Flight { id, tx: tx.clone() },
        );
        drop(flights);

        let result = load().await;

        // The flight has to be de-registered before the result is published, as otherwise a
        // caller could subscribe after the result was sent and wait forever.
        let mut flights = self.in_flight.lock().await;
        if flights.get(key).map(|flight| flight.id) == Some(id) {
            let _ = flights.remove(key);
        }
        drop(flights);

        match result {
            Ok(view) => {
                let _ = tx.send(Ok(view.clone()));
                Ok(view)
            }
            Err(error) => {
                let _ = tx.send(Err(format!("{:#}", error)));
                Err(error)
            }
        }
    }
}

impl Default for FlightGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::singleflight::FlightGroup;
    use crate::testing::test_async;
    use crate::value::ByteView;

    #[test]
    fn a_single_caller_simply_executes() {
        test_async(async {
            let flights = FlightGroup::new();

            let result = flights
                .execute("key", || async { Ok(ByteView::new(b"value")) })
                .await
                .unwrap();

            assert_eq!(result, ByteView::new(b"value"));
        });
    }

    #[test]
    fn concurrent_loads_for_one_key_are_coalesced() {
        test_async(async {
            let flights = Arc::new(FlightGroup::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let slow_load = |marker: &'static [u8]| {
                let invocations = invocations.clone();
                async move {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(ByteView::new(marker))
                }
            };

            let (first, second) = tokio::join!(
                flights.execute("key", || slow_load(b"leader")),
                flights.execute("key", || slow_load(b"waiter"))
            );

            // Only the leader actually executed, the waiter shares its result...
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(first.unwrap(), ByteView::new(b"leader"));
            assert_eq!(second.unwrap(), ByteView::new(b"leader"));
        });
    }

    #[test]
    fn loads_for_different_keys_run_independently() {
        test_async(async {
            let flights = Arc::new(FlightGroup::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let load = || {
                let invocations = invocations.clone();
                async move {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(ByteView::new(b"value"))
                }
            };

            let (first, second) = tokio::join!(
                flights.execute("one", load.clone()),
                flights.execute("two", load)
            );

            assert_eq!(invocations.load(Ordering::SeqCst), 2);
            assert!(first.is_ok());
            assert!(second.is_ok());
        });
    }

    #[test]
    fn errors_are_shared_with_all_waiters() {
        test_async(async {
            let flights = Arc::new(FlightGroup::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let failing_load = || {
                let invocations = invocations.clone();
                async move {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(anyhow::anyhow!("no value for this key"))
                }
            };

            let (first, second) = tokio::join!(
                flights.execute("key", failing_load.clone()),
                flights.execute("key", failing_load)
            );

            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(first.unwrap_err().to_string(), "no value for this key");
            assert_eq!(second.unwrap_err().to_string(), "no value for this key");
        });
    }

    #[test]
    fn completed_flights_are_cleaned_up() {
        test_async(async {
            let flights = FlightGroup::new();

            let _ = flights
                .execute("key", || async { Ok(ByteView::new(b"first")) })
                .await
                .unwrap();

            // A later call must start a fresh flight instead of waiting on the old one...
            let second = flights
                .execute("key", || async { Ok(ByteView::new(b"second")) })
                .await
                .unwrap();

            assert_eq!(second, ByteView::new(b"second"));
        });
    }
}
