use std::net::{TcpListener, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::PathBuf;

use pyro_common::protocol::map_io_error;
use pyro_common::transport::Connection;
use pyro_common::{Location, PyroError, Result};

/// A bound server socket.
pub(crate) enum Listener {
    Tcp(TcpListener, String),
    #[cfg(unix)]
    Unix(UnixListener, SocketFile),
}

/// Removes the socket file when the listener goes away.
#[cfg(unix)]
pub(crate) struct SocketFile(pub(crate) PathBuf);

#[cfg(unix)]
impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl Listener {
    /// Binds a location. Port 0 picks a free port; a stale Unix socket file
    /// is removed first.
    pub(crate) fn bind(location: &Location) -> Result<Self> {
        match location {
            Location::Tcp { host, port } => {
                let addr = format!("{}:{}", host, port);
                let addrs: Vec<_> = addr
                    .to_socket_addrs()
                    .map_err(|e| PyroError::Communication(format!("invalid address '{}': {}", addr, e)))?
                    .collect();
                let listener = TcpListener::bind(&addrs[..])
                    .map_err(|e| PyroError::Communication(format!("failed to bind to {}: {}", addr, e)))?;
                Ok(Listener::Tcp(listener, host.clone()))
            }
            #[cfg(unix)]
            Location::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|e| {
                        PyroError::Communication(format!("cannot remove stale socket {}: {}", path.display(), e))
                    })?;
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    PyroError::Communication(format!("failed to bind to {}: {}", path.display(), e))
                })?;
                Ok(Listener::Unix(listener, SocketFile(path.clone())))
            }
            #[cfg(not(unix))]
            Location::Unix { path } => Err(PyroError::Communication(format!(
                "unix domain sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    /// Where clients reach this listener, with the actual port.
    pub(crate) fn location(&self) -> Result<Location> {
        match self {
            Listener::Tcp(listener, host) => {
                let addr = listener.local_addr().map_err(|e| map_io_error(e, "reading local address"))?;
                Ok(Location::Tcp {
                    host: host.clone(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            Listener::Unix(_, file) => Ok(Location::Unix { path: file.0.clone() }),
        }
    }

    /// Blocks until a client connects.
    pub(crate) fn accept(&self) -> Result<Connection> {
        match self {
            Listener::Tcp(listener, _) => {
                let (stream, _) = listener.accept().map_err(|e| map_io_error(e, "accepting"))?;
                Connection::from_tcp(stream, None)
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().map_err(|e| map_io_error(e, "accepting"))?;
                Connection::from_unix(stream, None)
            }
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let result = match self {
            Listener::Tcp(listener, _) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Listener::Unix(listener, _) => listener.set_nonblocking(nonblocking),
        };
        result.map_err(|e| map_io_error(e, "configuring listener"))
    }
}
