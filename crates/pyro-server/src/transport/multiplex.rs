//! Multiplexed transport server.
//!
//! One thread runs a current-thread tokio runtime. Every client connection
//! is a task on that runtime: handshake first, then a request loop. Daemon
//! calls run synchronously on the loop thread, so exactly one ready request
//! is processed at a time; oneway calls still go to their helper threads.
//!
//! Several daemons can share one loop through [`MultiplexedServer::combine`].

use std::sync::Arc;

use pyro_common::protocol::{Message, MessageType};
use pyro_common::{Location, PyroError, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use super::{DisconnectGuard, Listener, ShutdownHandle};
use crate::connection::ClientConnection;
use crate::daemon::Daemon;

/// A daemon and the socket it is served on.
struct Endpoint {
    daemon: Arc<Daemon>,
    listener: Listener,
    location: Location,
}

enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl AsyncListener {
    /// Registers a clone of the listener with the running reactor.
    fn from_listener(listener: &Listener) -> Result<Self> {
        let io = |e: std::io::Error| PyroError::Communication(format!("failed to register listener: {}", e));
        listener.set_nonblocking(true)?;
        match listener {
            Listener::Tcp(l, _) => {
                let clone = l.try_clone().map_err(io)?;
                Ok(AsyncListener::Tcp(tokio::net::TcpListener::from_std(clone).map_err(io)?))
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let clone = l.try_clone().map_err(io)?;
                Ok(AsyncListener::Unix(tokio::net::UnixListener::from_std(clone).map_err(io)?))
            }
        }
    }
}

/// Serves one or more daemons from a single event-loop thread.
///
/// # Example
///
/// ```no_run
/// use pyro_common::{Config, Location, ServerType};
/// use pyro_server::{Daemon, MultiplexedServer};
///
/// let daemon = Daemon::new(Config::default().with_server_type(ServerType::Multiplex));
/// let server = MultiplexedServer::bind(daemon, &Location::Tcp { host: "localhost".into(), port: 0 }).unwrap();
/// println!("serving on {}", server.location());
/// server.serve().unwrap();
/// ```
pub struct MultiplexedServer {
    runtime: tokio::runtime::Runtime,
    endpoints: Vec<Endpoint>,
    shutdown: ShutdownHandle,
}

impl MultiplexedServer {
    /// Binds the listening socket and builds the event loop.
    ///
    /// The daemon's location is updated to the bound address.
    pub fn bind(daemon: Arc<Daemon>, location: &Location) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PyroError::Pyro(format!("failed to build event loop: {}", e)))?;
        let endpoint = Self::endpoint(daemon, location)?;
        tracing::info!(location = %endpoint.location, "Multiplexed server bound");
        Ok(Self {
            runtime,
            endpoints: vec![endpoint],
            shutdown: ShutdownHandle::new(),
        })
    }

    fn endpoint(daemon: Arc<Daemon>, location: &Location) -> Result<Endpoint> {
        let listener = Listener::bind(location)?;
        let location = listener.location()?;
        daemon.set_location(location.clone());
        Ok(Endpoint {
            daemon,
            listener,
            location,
        })
    }

    /// Serves another server's daemons from this loop as well.
    ///
    /// `other` is consumed; its shutdown handle no longer controls anything.
    pub fn combine(&mut self, other: MultiplexedServer) {
        for endpoint in other.endpoints {
            tracing::debug!(location = %endpoint.location, "Combined endpoint into event loop");
            self.endpoints.push(endpoint);
        }
    }

    /// Location of the first daemon.
    pub fn location(&self) -> &Location {
        &self.endpoints[0].location
    }

    /// Locations of all served daemons, in the order they were added.
    pub fn locations(&self) -> Vec<Location> {
        self.endpoints.iter().map(|e| e.location.clone()).collect()
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.endpoints[0].daemon
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the event loop until shutdown is requested. Open client
    /// connections are closed on the way out.
    pub fn serve(&self) -> Result<()> {
        self.runtime.block_on(self.run())
    }

    async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for endpoint in &self.endpoints {
            let listener = AsyncListener::from_listener(&endpoint.listener)?;
            tasks.spawn(accept_loop(Arc::clone(&endpoint.daemon), listener, self.shutdown.clone()));
            tasks.spawn(housekeeping(Arc::clone(&endpoint.daemon), self.shutdown.clone()));
            tracing::info!(location = %endpoint.location, "Multiplexed server serving");
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("Multiplexed server stopped");
        Ok(())
    }
}

async fn housekeeping(daemon: Arc<Daemon>, shutdown: ShutdownHandle) {
    let period = daemon.config().poll_timeout;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => daemon.housekeeping(),
        }
    }
}

async fn accept_loop(daemon: Arc<Daemon>, listener: AsyncListener, shutdown: ShutdownHandle) {
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.notified() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = accept(&listener) => accepted,
        };
        match accepted {
            Ok(Accepted::Tcp(stream, peer)) => {
                let _ = stream.set_nodelay(true);
                connections.spawn(serve_connection(Arc::clone(&daemon), stream, peer, shutdown.clone()));
            }
            #[cfg(unix)]
            Ok(Accepted::Unix(stream, peer)) => {
                connections.spawn(serve_connection(Arc::clone(&daemon), stream, peer, shutdown.clone()));
            }
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }
    while connections.join_next().await.is_some() {}
}

enum Accepted {
    Tcp(tokio::net::TcpStream, String),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream, String),
}

async fn accept(listener: &AsyncListener) -> std::io::Result<Accepted> {
    match listener {
        AsyncListener::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            Ok(Accepted::Tcp(stream, addr.to_string()))
        }
        #[cfg(unix)]
        AsyncListener::Unix(l) => {
            let (stream, _) = l.accept().await?;
            let peer = l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| format!("./u:{}", p.display())))
                .unwrap_or_else(|| "./u:<unnamed>".to_string());
            Ok(Accepted::Unix(stream, peer))
        }
    }
}

async fn serve_connection<S>(daemon: Arc<Daemon>, mut stream: S, peer: String, shutdown: ShutdownHandle)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client = ClientConnection::new(peer);
    let _guard = DisconnectGuard {
        daemon: &daemon,
        client: &client,
    };
    tracing::debug!(peer = client.peer(), "Connection accepted");

    let outcome = tokio::select! {
        _ = shutdown.notified() => Ok(()),
        outcome = connection_loop(&daemon, &client, &mut stream) => outcome,
    };
    match outcome {
        Ok(()) => tracing::debug!(peer = client.peer(), "Connection finished"),
        Err(e) => tracing::info!(peer = client.peer(), error = %e, "Dropping client connection"),
    }
    let _ = stream.shutdown().await;
}

async fn connection_loop<S>(daemon: &Arc<Daemon>, client: &ClientConnection, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wire = daemon.wire();
    let connect = Message::recv_async(stream, Some(&[MessageType::Connect]), &wire).await?;
    let (reply, accepted) = daemon.handshake_response(client, &connect)?;
    write(stream, &reply).await?;
    if !accepted {
        return Ok(());
    }

    loop {
        let msg = match Message::recv_async(stream, Some(&[MessageType::Invoke, MessageType::Ping]), &wire).await {
            Ok(msg) => msg,
            Err(PyroError::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Some(reply) = daemon.process_message(client, msg)? {
            write(stream, &reply).await?;
        }
    }
}

async fn write<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    stream
        .write_all(data)
        .await
        .map_err(|e| pyro_common::protocol::map_io_error(e, "sending"))
}
