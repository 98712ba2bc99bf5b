//! Transport servers.
//!
//! Two interchangeable ways to put a [`Daemon`] on the network:
//!
//! - **[`ThreadPoolServer`]**: blocking sockets, one pooled worker thread per
//!   client connection
//! - **[`MultiplexedServer`]**: a single-threaded tokio event loop serving
//!   every connection, one ready request at a time
//!
//! Both listen on TCP or (on Unix) a Unix domain socket, run the daemon's
//! housekeeping every `poll_timeout`, and stop through a [`ShutdownHandle`].

mod listener;
mod multiplex;
mod threadpool;

pub use multiplex::MultiplexedServer;
pub use threadpool::ThreadPoolServer;

pub(crate) use listener::Listener;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use pyro_common::transport::Connection;
use pyro_common::{Location, Result, ServerType};
use tokio::sync::Notify;

use crate::connection::ClientConnection;
use crate::daemon::Daemon;

/// The server type selected by [`Config::server_type`](pyro_common::Config).
pub enum Server {
    Thread(ThreadPoolServer),
    Multiplex(MultiplexedServer),
}

impl Server {
    /// Binds a server of the type the daemon is configured for.
    pub fn bind(daemon: Arc<Daemon>, location: &Location) -> Result<Self> {
        match daemon.config().server_type {
            ServerType::Thread => ThreadPoolServer::bind(daemon, location).map(Server::Thread),
            ServerType::Multiplex => MultiplexedServer::bind(daemon, location).map(Server::Multiplex),
        }
    }

    pub fn serve(&self) -> Result<()> {
        match self {
            Server::Thread(server) => server.serve(),
            Server::Multiplex(server) => server.serve(),
        }
    }

    pub fn location(&self) -> &Location {
        match self {
            Server::Thread(server) => server.location(),
            Server::Multiplex(server) => server.location(),
        }
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        match self {
            Server::Thread(server) => server.daemon(),
            Server::Multiplex(server) => server.daemon(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        match self {
            Server::Thread(server) => server.shutdown_handle(),
            Server::Multiplex(server) => server.shutdown_handle(),
        }
    }
}

/// Stops a running server from any thread.
///
/// Cloning is cheap; all clones control the same server.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    stopped: Mutex<bool>,
    changed: Condvar,
    notify: Notify,
    /// Locations to poke so a blocking accept returns
    wake: Mutex<Vec<Location>>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests the server to stop. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut stopped = self.inner.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.inner.changed.notify_all();
        self.inner.notify.notify_waiters();

        let wake = self.inner.wake.lock().clone();
        for location in wake {
            // Unblocks accept(); the loop sees the flag and exits.
            let _ = Connection::connect(&location, Some(Duration::from_secs(1)));
        }
        tracing::debug!("Server shutdown requested");
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            self.inner.changed.wait(&mut stopped);
        }
    }

    /// Blocks for at most `timeout`. Returns whether shutdown was requested.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if !*stopped {
            self.inner.changed.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    /// Completes once shutdown is requested.
    pub(crate) async fn notified(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent shutdown is not missed.
        notified.as_mut().enable();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }

    pub(crate) fn add_wake_location(&self, location: Location) {
        self.inner.wake.lock().push(location);
    }
}

/// Reports a client as gone when the connection's serving scope ends,
/// including by panic.
pub(crate) struct DisconnectGuard<'a> {
    pub(crate) daemon: &'a Arc<Daemon>,
    pub(crate) client: &'a ClientConnection,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        self.daemon.client_disconnected(self.client);
    }
}

/// Runs `daemon.housekeeping()` every `interval` until shutdown.
pub(crate) fn spawn_housekeeping(
    daemon: Arc<Daemon>,
    shutdown: ShutdownHandle,
    interval: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("Pyro-housekeeping".to_string())
        .spawn(move || {
            while !shutdown.wait_timeout(interval) {
                daemon.housekeeping();
            }
        })
}
