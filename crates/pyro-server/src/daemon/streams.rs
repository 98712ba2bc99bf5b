use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pyro_common::RemoteException;
use serde_json::Value;
use uuid::Uuid;

type ItemIterator = Box<dyn Iterator<Item = Value> + Send>;

struct StreamEntry {
    /// Connection id of the owning client; `None` once it disconnected
    owner: Option<u64>,
    created: Instant,
    /// Set when the owner disconnected
    idle_since: Option<Instant>,
    /// Locked separately so a slow item never holds up the table
    items: Arc<Mutex<ItemIterator>>,
}

/// Server-side cursors of streamed results.
///
/// The table lock only covers bookkeeping. Iterators are advanced under
/// their own lock, so the housekeeping pass and other streams never wait
/// on user code.
#[derive(Default)]
pub struct StreamTable {
    entries: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an iterator and returns its new stream id.
    pub fn create(&self, owner: u64, items: ItemIterator) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.entries.lock().insert(
            id.clone(),
            StreamEntry {
                owner: Some(owner),
                created: now,
                idle_since: None,
                items: Arc::new(Mutex::new(items)),
            },
        );
        tracing::debug!(stream = %id, owner, "Created item stream");
        id
    }

    /// Advances a stream.
    ///
    /// An exhausted stream is removed and answered with `StopIteration`. A
    /// stream whose client went away is adopted by the requesting client.
    pub fn next(&self, id: &str, client: u64) -> Result<Value, RemoteException> {
        let items = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                return Err(RemoteException::pyro_error("item stream terminated"));
            };
            if entry.owner.is_none() {
                entry.owner = Some(client);
                entry.idle_since = None;
            }
            Arc::clone(&entry.items)
        };
        let advanced = {
            let mut items = items.lock();
            catch_unwind(AssertUnwindSafe(|| items.next()))
        };
        match advanced {
            Ok(Some(item)) => Ok(item),
            Ok(None) => {
                self.remove_if_current(id, &items);
                tracing::debug!(stream = %id, "Item stream exhausted");
                Err(RemoteException::stop_iteration())
            }
            Err(panic) => {
                self.remove_if_current(id, &items);
                Err(RemoteException::new(
                    "PanicError",
                    format!("item stream panicked: {}", crate::daemon::panic_message(&*panic)),
                ))
            }
        }
    }

    fn remove_if_current(&self, id: &str, items: &Arc<Mutex<ItemIterator>>) {
        let mut entries = self.entries.lock();
        if entries.get(id).is_some_and(|entry| Arc::ptr_eq(&entry.items, items)) {
            entries.remove(id);
        }
    }

    /// Removes a stream. Returns whether it existed.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.entries.lock().remove(id).is_some();
        if removed {
            tracing::debug!(stream = %id, "Closed item stream");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases the streams of a disconnected client.
    ///
    /// With a zero linger they are dropped at once, otherwise they become
    /// ownerless and expire `linger` after now unless a client resumes them.
    pub fn client_disconnected(&self, client: u64, linger: Duration) {
        let mut entries = self.entries.lock();
        if linger.is_zero() {
            entries.retain(|_, entry| entry.owner != Some(client));
            return;
        }
        let now = Instant::now();
        for entry in entries.values_mut() {
            if entry.owner == Some(client) {
                entry.owner = None;
                entry.idle_since = Some(now);
            }
        }
    }

    /// Removes streams past their lifetime or linger. Returns how many.
    pub fn expire(&self, lifetime: Option<Duration>, linger: Duration, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|id, entry| {
            let too_old = lifetime.is_some_and(|l| now.saturating_duration_since(entry.created) > l);
            let abandoned = entry
                .idle_since
                .is_some_and(|idle| now.saturating_duration_since(idle) > linger);
            if too_old || abandoned {
                tracing::debug!(stream = %id, too_old, abandoned, "Expiring item stream");
            }
            !(too_old || abandoned)
        });
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numbers(n: i64) -> ItemIterator {
        Box::new((0..n).map(|i| json!(i)))
    }

    #[test]
    fn test_exhaustion_removes_stream() {
        let table = StreamTable::new();
        let id = table.create(1, numbers(2));
        assert_eq!(table.next(&id, 1).unwrap(), json!(0));
        assert_eq!(table.next(&id, 1).unwrap(), json!(1));
        assert!(table.next(&id, 1).unwrap_err().is_stop_iteration());
        assert!(!table.contains(&id));
        assert_eq!(table.next(&id, 1).unwrap_err().message, "item stream terminated");
    }

    #[test]
    fn test_close_removes_stream() {
        let table = StreamTable::new();
        let id = table.create(1, numbers(5));
        assert!(table.close(&id));
        assert!(!table.close(&id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_disconnect_without_linger_drops() {
        let table = StreamTable::new();
        let mine = table.create(1, numbers(5));
        let theirs = table.create(2, numbers(5));
        table.client_disconnected(1, Duration::ZERO);
        assert!(!table.contains(&mine));
        assert!(table.contains(&theirs));
    }

    #[test]
    fn test_linger_expiry_and_resume() {
        let table = StreamTable::new();
        let resumed = table.create(1, numbers(5));
        let abandoned = table.create(1, numbers(5));
        table.client_disconnected(1, Duration::from_secs(10));

        // A reconnected client adopts the stream and stops its linger clock.
        assert_eq!(table.next(&resumed, 7).unwrap(), json!(0));

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(table.expire(None, Duration::from_secs(10), later), 1);
        assert!(table.contains(&resumed));
        assert!(!table.contains(&abandoned));
    }

    #[test]
    fn test_lifetime_expiry() {
        let table = StreamTable::new();
        let id = table.create(1, numbers(5));
        let now = Instant::now();
        assert_eq!(table.expire(Some(Duration::from_secs(60)), Duration::from_secs(30), now), 0);
        let later = now + Duration::from_secs(61);
        assert_eq!(table.expire(Some(Duration::from_secs(60)), Duration::from_secs(30), later), 1);
        assert!(!table.contains(&id));
    }

    #[test]
    fn test_panicking_iterator_is_removed() {
        let table = StreamTable::new();
        let id = table.create(1, Box::new(std::iter::from_fn(|| -> Option<Value> { panic!("boom") })));
        let err = table.next(&id, 1).unwrap_err();
        assert_eq!(err.kind, "PanicError");
        assert!(err.message.contains("boom"));
        assert!(!table.contains(&id));
    }

    #[test]
    fn test_slow_stream_does_not_block_others() {
        let table = Arc::new(StreamTable::new());
        let slow = table.create(
            1,
            Box::new(std::iter::repeat_with(|| {
                std::thread::sleep(Duration::from_secs(2));
                json!("late")
            })),
        );
        let fast = table.create(2, numbers(3));

        let advancing = {
            let table = Arc::clone(&table);
            let slow = slow.clone();
            std::thread::spawn(move || table.next(&slow, 1))
        };
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        assert_eq!(table.next(&fast, 2).unwrap(), json!(0));
        assert!(table.close(&fast));
        table.client_disconnected(3, Duration::ZERO);
        assert_eq!(table.expire(None, Duration::from_secs(10), Instant::now()), 0);
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());

        assert_eq!(advancing.join().unwrap().unwrap(), json!("late"));
    }

    #[test]
    fn test_close_during_advance_wins() {
        let table = Arc::new(StreamTable::new());
        let id = table.create(
            1,
            Box::new((0..1).map(|i| {
                std::thread::sleep(Duration::from_millis(300));
                json!(i)
            })),
        );
        let advancing = {
            let table = Arc::clone(&table);
            let id = id.clone();
            std::thread::spawn(move || table.next(&id, 1))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(table.close(&id));
        assert_eq!(advancing.join().unwrap().unwrap(), json!(0));
        assert_eq!(table.next(&id, 1).unwrap_err().message, "item stream terminated");
    }
}
