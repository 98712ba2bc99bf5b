//! Thread-pool transport server.
//!
//! A blocking accept loop hands every client connection to the elastic
//! worker [`Pool`]. A worker runs the handshake and then serves requests on
//! that connection until the client goes away. When the pool is exhausted
//! the client gets a CONNECT_FAIL instead of waiting.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pyro_common::protocol::{Message, MessageType};
use pyro_common::transport::{Connection, Transport};
use pyro_common::{Location, PyroError, Result};

use super::{spawn_housekeeping, DisconnectGuard, Listener, ShutdownHandle};
use crate::connection::ClientConnection;
use crate::daemon::Daemon;
use crate::pool::{NoFreeWorkers, Pool, PoolConfig};

/// Sent to clients that arrive while every worker is busy.
pub const NO_FREE_WORKERS: &str = "no free workers, increase server threadpool size";

/// How long a refused client gets to send its CONNECT.
const REFUSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves a daemon with one pooled worker thread per connection.
///
/// # Example
///
/// ```no_run
/// use pyro_common::{Config, Location};
/// use pyro_server::{Daemon, ThreadPoolServer};
///
/// let daemon = Daemon::new(Config::default());
/// let server = ThreadPoolServer::bind(daemon, &Location::Tcp { host: "localhost".into(), port: 9090 }).unwrap();
/// let shutdown = server.shutdown_handle();
/// std::thread::spawn(move || server.serve());
/// // ...
/// shutdown.shutdown();
/// ```
pub struct ThreadPoolServer {
    daemon: Arc<Daemon>,
    listener: Listener,
    location: Location,
    pool: Pool<Connection>,
    shutdown: ShutdownHandle,
}

impl ThreadPoolServer {
    /// Binds the listening socket and starts the minimum number of workers.
    ///
    /// The daemon's location is updated to the bound address.
    ///
    /// # Errors
    ///
    /// Returns `Communication` if the address cannot be bound and
    /// `Configuration` for inconsistent pool sizing.
    pub fn bind(daemon: Arc<Daemon>, location: &Location) -> Result<Self> {
        let listener = Listener::bind(location)?;
        let location = listener.location()?;
        daemon.set_location(location.clone());

        let worker_daemon = Arc::clone(&daemon);
        let pool = Pool::new(
            "Pyro-worker",
            PoolConfig::from_config(daemon.config()),
            move |conn: Connection| serve_client(&worker_daemon, conn),
        )?;

        let shutdown = ShutdownHandle::new();
        shutdown.add_wake_location(location.clone());
        tracing::info!(location = %location, "Thread-pool server bound");
        Ok(Self {
            daemon,
            listener,
            location,
            pool,
            shutdown,
        })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts clients until shutdown is requested.
    ///
    /// Connections already being served are not interrupted; they end when
    /// their client disconnects.
    pub fn serve(&self) -> Result<()> {
        let housekeeping = spawn_housekeeping(
            Arc::clone(&self.daemon),
            self.shutdown.clone(),
            self.daemon.config().poll_timeout,
        )
        .map_err(|e| PyroError::Pyro(format!("failed to start housekeeping thread: {}", e)))?;

        tracing::info!(location = %self.location, "Thread-pool server serving");
        while !self.shutdown.is_shutdown() {
            match self.listener.accept() {
                Ok(conn) if self.shutdown.is_shutdown() => drop(conn),
                Ok(conn) => self.dispatch(conn),
                Err(e) if self.shutdown.is_shutdown() => {
                    tracing::debug!(error = %e, "Accept failed during shutdown");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }

        self.pool.close();
        let _ = housekeeping.join();
        tracing::info!(location = %self.location, "Thread-pool server stopped");
        Ok(())
    }

    fn dispatch(&self, mut conn: Connection) {
        if let Err(e) = conn.set_timeout(self.daemon.config().comm_timeout) {
            tracing::warn!(peer = conn.peer(), error = %e, "Dropping connection");
            return;
        }
        tracing::debug!(peer = conn.peer(), "Connection accepted");
        if let Err(NoFreeWorkers(conn)) = self.pool.process(conn) {
            tracing::warn!(peer = conn.peer(), workers = self.pool.workers(), "No free workers, refusing client");
            refuse(Arc::clone(&self.daemon), conn);
        }
    }
}

impl Drop for ThreadPoolServer {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Runs on a worker: handshake, then requests until the client leaves.
fn serve_client(daemon: &Arc<Daemon>, mut conn: Connection) {
    let client = ClientConnection::new(conn.peer());
    let _guard = DisconnectGuard {
        daemon,
        client: &client,
    };

    match daemon.handshake(&client, &mut conn) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::debug!(peer = client.peer(), error = %e, "Handshake failed");
            conn.close();
            return;
        }
    }

    loop {
        match daemon.handle_request(&client, &mut conn) {
            Ok(()) => {}
            Err(PyroError::ConnectionClosed(_)) => {
                tracing::debug!(peer = client.peer(), "Client closed the connection");
                break;
            }
            Err(e) => {
                tracing::info!(peer = client.peer(), error = %e, "Dropping client connection");
                break;
            }
        }
    }
    conn.close();
}

/// Answers the client's CONNECT with CONNECT_FAIL on a helper thread, so
/// the accept loop is not held up by a slow client.
fn refuse(daemon: Arc<Daemon>, mut conn: Connection) {
    let spawned = thread::Builder::new()
        .name("Pyro-refuse".to_string())
        .spawn(move || {
            let timeout = daemon.config().comm_timeout.unwrap_or(REFUSE_TIMEOUT).min(REFUSE_TIMEOUT);
            let outcome = conn
                .set_timeout(Some(timeout))
                .and_then(|_| Message::recv(&mut conn, Some(&[MessageType::Connect]), &daemon.wire()))
                .and_then(|msg| daemon.refuse_connect(&msg, NO_FREE_WORKERS))
                .and_then(|reply| conn.send(&reply));
            if let Err(e) = outcome {
                tracing::debug!(peer = conn.peer(), error = %e, "Could not notify refused client");
            }
            conn.close();
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to start refuse thread");
    }
}
