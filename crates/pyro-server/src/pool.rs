//! Elastic worker pool.
//!
//! Worker threads are started on demand up to a hard maximum and retire
//! after sitting idle for a while, down to a minimum that is kept warm.
//! Submitting work never blocks: when every worker is busy and the pool is
//! at its maximum the item is handed back as [`NoFreeWorkers`].
//!
//! # Architecture
//!
//! ```text
//! process(item) ──► idle worker available? ──► queue + wake one
//!                          │ no
//!                          ├── below max? ──► queue + start worker
//!                          └── at max     ──► Err(NoFreeWorkers(item))
//! ```
//!
//! The queue, worker count and idle count share one mutex; idle workers
//! wait on a condvar with the idle timeout.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use pyro_common::{Config, PyroError, Result};

use crate::daemon::panic_message;

/// Sizing of a [`Pool`].
///
/// # Default Configuration
///
/// - `min_workers`: 4
/// - `max_workers`: 80
/// - `idle_timeout`: 5 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_workers: usize,
    /// Hard upper bound on workers
    pub max_workers: usize,
    /// Idle time after which a worker above the minimum retires
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 80,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Pool sizing taken from the thread-pool settings of a [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_workers: config.threadpool_size_min,
            max_workers: config.threadpool_size,
            idle_timeout: config.worker_idle_timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(PyroError::Configuration("pool needs at least one worker".to_string()));
        }
        if self.min_workers > self.max_workers {
            return Err(PyroError::Configuration(format!(
                "minimum pool size {} exceeds maximum {}",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

/// Returned by [`Pool::process`] when every worker is busy and the pool
/// cannot grow. Carries the rejected item back to the caller.
pub struct NoFreeWorkers<T>(pub T);

impl<T> NoFreeWorkers<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for NoFreeWorkers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoFreeWorkers(..)")
    }
}

impl<T> fmt::Display for NoFreeWorkers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free workers")
    }
}

struct State<T> {
    queue: VecDeque<T>,
    workers: usize,
    idle: usize,
    closed: bool,
}

struct Shared<T> {
    name: String,
    config: PoolConfig,
    state: Mutex<State<T>>,
    available: Condvar,
    handler: Box<dyn Fn(T) + Send + Sync>,
    spawned: AtomicUsize,
}

/// A pool of worker threads running one handler over submitted items.
pub struct Pool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Pool<T> {
    /// Creates the pool and starts the minimum number of workers.
    ///
    /// # Arguments
    ///
    /// * `name` - Prefix of the worker thread names
    /// * `config` - Pool sizing
    /// * `handler` - Run once per submitted item on a worker thread
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for inconsistent sizing and `Pyro` if a
    /// worker thread cannot be started.
    pub fn new<F>(name: impl Into<String>, config: PoolConfig, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        config.validate()?;
        let shared = Arc::new(Shared {
            name: name.into(),
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                closed: false,
            }),
            available: Condvar::new(),
            handler: Box::new(handler),
            spawned: AtomicUsize::new(0),
        });

        let pool = Self { shared };
        for _ in 0..pool.shared.config.min_workers {
            pool.shared.state.lock().workers += 1;
            if let Err(e) = spawn_worker(&pool.shared) {
                pool.shared.state.lock().workers -= 1;
                pool.close();
                return Err(e);
            }
        }
        tracing::debug!(
            pool = %pool.shared.name,
            min = pool.shared.config.min_workers,
            max = pool.shared.config.max_workers,
            "Worker pool started"
        );
        Ok(pool)
    }

    /// Hands an item to a worker without blocking.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`NoFreeWorkers`] when all workers are busy
    /// and the pool is at its maximum size, or when the pool is closed.
    pub fn process(&self, item: T) -> std::result::Result<(), NoFreeWorkers<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(NoFreeWorkers(item));
        }
        if state.idle > state.queue.len() {
            state.queue.push_back(item);
            drop(state);
            self.shared.available.notify_one();
            return Ok(());
        }
        if state.workers >= self.shared.config.max_workers {
            return Err(NoFreeWorkers(item));
        }

        state.queue.push_back(item);
        state.workers += 1;
        drop(state);
        if let Err(e) = spawn_worker(&self.shared) {
            tracing::error!(pool = %self.shared.name, error = %e, "Failed to grow worker pool");
            let mut state = self.shared.state.lock();
            state.workers -= 1;
            return match state.queue.pop_back() {
                Some(item) => Err(NoFreeWorkers(item)),
                // an existing worker already took it
                None => Ok(()),
            };
        }
        Ok(())
    }

    /// Number of live workers.
    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Number of workers waiting for an item.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Stops accepting items and lets the workers exit.
    ///
    /// Items still queued are dropped. Workers busy with an item finish it
    /// first; this call does not wait for them.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        self.shared.available.notify_all();
        tracing::debug!(pool = %self.shared.name, dropped = dropped.len(), "Worker pool closed");
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Starts one worker. The caller has already counted it in `workers`.
fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>) -> Result<()> {
    let number = shared.spawned.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{}", shared.name, number);
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(&shared))
        .map(|_| ())
        .map_err(|e| PyroError::Pyro(format!("failed to start worker thread: {}", e)))
}

fn worker_loop<T: Send + 'static>(shared: &Shared<T>) {
    let mut state = shared.state.lock();
    loop {
        if let Some(item) = state.queue.pop_front() {
            drop(state);
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (shared.handler)(item))) {
                tracing::error!(pool = %shared.name, panic = %panic_message(&*panic), "Worker handler panicked");
            }
            state = shared.state.lock();
            continue;
        }
        if state.closed {
            break;
        }

        state.idle += 1;
        let timed_out = shared
            .available
            .wait_for(&mut state, shared.config.idle_timeout)
            .timed_out();
        state.idle -= 1;

        if timed_out && state.queue.is_empty() && state.workers > shared.config.min_workers {
            tracing::trace!(pool = %shared.name, "Idle worker retiring");
            break;
        }
    }
    state.workers -= 1;
}
