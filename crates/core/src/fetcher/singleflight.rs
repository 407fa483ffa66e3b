//! Request coalescing: at most one in-flight execution per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Slot<T: Clone> {
    id: u64,
    flight: WeakShared<BoxFuture<'static, T>>,
}

/// Map of in-flight work keyed by fingerprint.
///
/// The map only holds weak references: the shared work is dropped once
/// every waiter has gone away, and the next caller starts it afresh.
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, Slot<T>>>>,
    next_id: Mutex<u64>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Mutex::new(0),
        }
    }

    /// Join the flight for `key`, starting it with `start` if none is live.
    ///
    /// Returns the shared future and whether an existing flight was joined.
    /// Awaiting is left to the caller so each waiter can apply its own
    /// cancellation.
    pub fn join<F>(&self, key: &str, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(flight) = inflight.get(key).and_then(|slot| slot.flight.upgrade()) {
            return (flight, true);
        }
        // Slots of flights dropped before completing.
        inflight.retain(|_, slot| slot.flight.upgrade().is_some());

        let id = {
            let mut next = match self.next_id.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *next += 1;
            *next
        };

        let work = start();
        let map = Arc::clone(&self.inflight);
        let owned_key = key.to_string();
        let flight = async move {
            let out = work.await;
            if let Ok(mut inflight) = map.lock() {
                if inflight.get(&owned_key).is_some_and(|slot| slot.id == id) {
                    inflight.remove(&owned_key);
                }
            }
            out
        }
        .boxed()
        .shared();

        if let Some(weak) = flight.downgrade() {
            inflight.insert(key.to_string(), Slot { id, flight: weak });
        }
        (flight, false)
    }

    /// Keys with a live flight.
    pub fn len(&self) -> usize {
        match self.inflight.lock() {
            Ok(inflight) => inflight
                .values()
                .filter(|slot| slot.flight.upgrade().is_some())
                .count(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<Result<u32, String>>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let (flight, _) = flights.join("k", || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    }
                    .boxed()
                });
                flight.await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let flights: SingleFlight<Result<u32, String>> = SingleFlight::new();
        let (a, joined_a) = flights.join("k", || {
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err("boom".to_string())
            }
            .boxed()
        });
        let (b, joined_b) = flights.join("k", || async { Ok(1) }.boxed());

        assert!(!joined_a);
        assert!(joined_b);
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, Err("boom".to_string()));
        assert_eq!(rb, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_abandoned_flight_restarts() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let (first, _) = flights.join("k", || std::future::pending::<u32>().boxed());
        drop(first);

        let (second, joined) = flights.join("k", || async { 2 }.boxed());
        assert!(!joined);
        assert_eq!(second.await, 2);
    }

    #[tokio::test]
    async fn test_abandoned_slots_are_pruned() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        for key in ["a", "b", "c"] {
            let (flight, _) = flights.join(key, || std::future::pending::<u32>().boxed());
            drop(flight);
        }
        assert_eq!(flights.slots(), 1);
        assert!(flights.is_empty());

        let (live, _) = flights.join("d", || std::future::pending::<u32>().boxed());
        assert_eq!(flights.slots(), 1);
        assert_eq!(flights.len(), 1);
        drop(live);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let (a, _) = flights.join("a", || async { 1 }.boxed());
        let (b, joined) = flights.join("b", || async { 2 }.boxed());
        assert!(!joined);
        assert_eq!((a.await, b.await), (1, 2));
    }
}
