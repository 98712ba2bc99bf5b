use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::protocol::error::{map_io_error, PyroError, Result};
use crate::transport::Transport;
use crate::uri::Location;

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A socket-backed [`Transport`].
///
/// Wraps one TCP or Unix domain stream with optional read/write timeouts.
/// Every I/O failure closes the socket before the error is returned, so a
/// connection that produced an error is never read from again.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use pyro_common::transport::Connection;
/// use pyro_common::Location;
///
/// let location = Location::Tcp { host: "localhost".into(), port: 9090 };
/// let conn = Connection::connect(&location, Some(Duration::from_secs(5))).unwrap();
/// println!("connected to {}", conn.peer());
/// ```
pub struct Connection {
    socket: Socket,
    peer: String,
    closed: bool,
}

impl Connection {
    /// Opens a connection to a location.
    ///
    /// For TCP the host may resolve to several addresses; each is tried in
    /// turn until one accepts.
    ///
    /// # Arguments
    ///
    /// * `location` - Where to connect
    /// * `timeout` - Connect and per-operation timeout, `None` blocks indefinitely
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if connecting timed out, `Communication` if the
    /// address cannot be resolved or no address accepts the connection.
    pub fn connect(location: &Location, timeout: Option<Duration>) -> Result<Self> {
        match location {
            Location::Tcp { host, port } => {
                let addr = format!("{}:{}", host, port);
                let socket_addrs = addr.to_socket_addrs().map_err(|e| {
                    PyroError::Communication(format!("invalid address '{}': {}", addr, e))
                })?;

                let mut last_err = None;
                for socket_addr in socket_addrs {
                    let attempt = match timeout {
                        Some(t) => TcpStream::connect_timeout(&socket_addr, t),
                        None => TcpStream::connect(socket_addr),
                    };
                    match attempt {
                        Ok(stream) => return Self::from_tcp(stream, timeout),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(connect_failed(&addr, last_err))
            }
            #[cfg(unix)]
            Location::Unix { path } => {
                let stream = UnixStream::connect(path).map_err(|e| {
                    PyroError::Communication(format!("cannot connect to {}: {}", path.display(), e))
                })?;
                Self::from_unix(stream, timeout)
            }
            #[cfg(not(unix))]
            Location::Unix { path } => Err(PyroError::Communication(format!(
                "unix domain sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    /// Wraps an already established TCP stream.
    pub fn from_tcp(stream: TcpStream, timeout: Option<Duration>) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        // Replies are small and latency sensitive.
        stream
            .set_nodelay(true)
            .map_err(|e| map_io_error(e, "configuring socket"))?;
        let mut conn = Self {
            socket: Socket::Tcp(stream),
            peer,
            closed: false,
        };
        conn.set_timeout(timeout)?;
        Ok(conn)
    }

    /// Wraps an already established Unix domain stream.
    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream, timeout: Option<Duration>) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| format!("./u:{}", p.display())))
            .unwrap_or_else(|| "./u:<unnamed>".to_string());
        let mut conn = Self {
            socket: Socket::Unix(stream),
            peer,
            closed: false,
        };
        conn.set_timeout(timeout)?;
        Ok(conn)
    }

    /// Sets the read and write timeout. `None` blocks indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let result = match &self.socket {
            Socket::Tcp(s) => s.set_read_timeout(timeout).and_then(|_| s.set_write_timeout(timeout)),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(timeout).and_then(|_| s.set_write_timeout(timeout)),
        };
        result.map_err(|e| PyroError::Communication(format!("failed to set timeout: {}", e)))
    }

    /// Human readable peer address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn io_failed(&mut self, err: std::io::Error, context: &str) -> PyroError {
        self.close();
        map_io_error(err, context)
    }
}

impl Transport for Connection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(PyroError::ConnectionClosed("sending: connection is closed".to_string()));
        }
        let result = match &mut self.socket {
            Socket::Tcp(s) => s.write_all(data).and_then(|_| s.flush()),
            #[cfg(unix)]
            Socket::Unix(s) => s.write_all(data).and_then(|_| s.flush()),
        };
        result.map_err(|e| self.io_failed(e, "sending"))
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Err(PyroError::ConnectionClosed("receiving: connection is closed".to_string()));
        }
        let mut buf = vec![0u8; size];
        if size == 0 {
            return Ok(buf);
        }
        let result = match &mut self.socket {
            Socket::Tcp(s) => s.read_exact(&mut buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read_exact(&mut buf),
        };
        match result {
            Ok(()) => Ok(buf),
            Err(e) => Err(self.io_failed(e, "receiving")),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = match &self.socket {
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

fn connect_failed(addr: &str, err: Option<std::io::Error>) -> PyroError {
    match err {
        Some(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            PyroError::Timeout(format!("connecting to {} timed out", addr))
        }
        Some(e) => PyroError::Communication(format!("cannot connect to {}: {}", addr, e)),
        None => PyroError::Communication(format!("cannot connect to {}: no addresses resolved", addr)),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let location = Location::Tcp { host: "127.0.0.1".into(), port };
        let client = Connection::connect(&location, Some(Duration::from_secs(2))).unwrap();
        let server = Connection::from_tcp(accept.join().unwrap(), Some(Duration::from_secs(2))).unwrap();
        (client, server)
    }

    #[test]
    fn test_connect_timeout_is_retryable() {
        let err = connect_failed("10.0.0.1:9090", Some(std::io::Error::from(ErrorKind::TimedOut)));
        assert!(matches!(err, PyroError::Timeout(_)), "{:?}", err);
        assert!(err.is_retryable());

        let refused = connect_failed("10.0.0.1:9090", Some(std::io::Error::from(ErrorKind::ConnectionRefused)));
        assert!(matches!(refused, PyroError::Communication(_)));
        assert!(!refused.is_retryable());
        assert!(matches!(connect_failed("nowhere:1", None), PyroError::Communication(_)));
    }

    #[test]
    fn test_send_and_recv_exact() {
        let (mut client, mut server) = pair();
        client.send(b"hello world").unwrap();
        assert_eq!(server.recv(5).unwrap(), b"hello");
        assert_eq!(server.recv(6).unwrap(), b" world");
        assert!(server.recv(0).unwrap().is_empty());
    }

    #[test]
    fn test_peer_close_is_connection_closed() {
        let (mut client, mut server) = pair();
        client.close();
        let err = server.recv(4).unwrap_err();
        assert!(matches!(err, PyroError::ConnectionClosed(_)));
        assert!(server.is_closed());
    }

    #[test]
    fn test_read_timeout() {
        let (_client, mut server) = pair();
        server.set_timeout(Some(Duration::from_millis(50))).unwrap();
        let err = server.recv(1).unwrap_err();
        assert!(matches!(err, PyroError::Timeout(_)));
        assert!(server.is_closed());
    }

    #[test]
    fn test_use_after_close() {
        let (mut client, _server) = pair();
        client.close();
        client.close();
        assert!(matches!(client.send(b"x"), Err(PyroError::ConnectionClosed(_))));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let location = Location::Tcp { host: "127.0.0.1".into(), port };
        let err = Connection::connect(&location, Some(Duration::from_secs(1))).err().unwrap();
        assert!(matches!(err, PyroError::Communication(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyro.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);

        let mut client = Connection::connect(&Location::Unix { path: path.clone() }, None).unwrap();
        let mut server = Connection::from_unix(accept.join().unwrap(), None).unwrap();
        server.send(b"pong").unwrap();
        assert_eq!(client.recv(4).unwrap(), b"pong");
    }
}
