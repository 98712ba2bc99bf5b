use thiserror::Error;

use crate::protocol::exception::RemoteException;

/// Errors raised by the protocol engine.
///
/// The variants form the taxonomy shared by client and server:
///
/// - **Communication**: [`Communication`](PyroError::Communication) and its
///   refinements [`ConnectionClosed`](PyroError::ConnectionClosed) and
///   [`Timeout`](PyroError::Timeout)
/// - **Protocol**: [`Protocol`](PyroError::Protocol) and
///   [`MessageTooLarge`](PyroError::MessageTooLarge). A protocol violation
///   leaves the connection in an unknown read state, so it is treated as a
///   communication failure as well.
/// - **Serialization**: [`Serialize`](PyroError::Serialize)
/// - **Registry misuse**: [`Daemon`](PyroError::Daemon)
/// - **Everything else**: [`Pyro`](PyroError::Pyro),
///   [`Attribute`](PyroError::Attribute),
///   [`Configuration`](PyroError::Configuration)
///
/// Exceptions raised inside a remote method arrive as
/// [`Remote`](PyroError::Remote) and carry the remote traceback.
#[derive(Error, Debug)]
pub enum PyroError {
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("{0}")]
    Pyro(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Remote(RemoteException),
}

impl PyroError {
    /// Returns true for errors that leave the connection unusable.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            PyroError::Communication(_)
                | PyroError::ConnectionClosed(_)
                | PyroError::Timeout(_)
                | PyroError::Protocol(_)
                | PyroError::MessageTooLarge { .. }
        )
    }

    /// Returns true for errors the proxy retry policy re-attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PyroError::ConnectionClosed(_) | PyroError::Timeout(_))
    }

    /// Returns the remote exception if this error came from the other side.
    pub fn remote(&self) -> Option<&RemoteException> {
        match self {
            PyroError::Remote(exc) => Some(exc),
            _ => None,
        }
    }

    /// Converts this error into an exception that can be sent to a client.
    pub fn to_remote_exception(&self) -> RemoteException {
        let kind = match self {
            PyroError::Remote(exc) => return exc.clone(),
            PyroError::Communication(_) => "CommunicationError",
            PyroError::ConnectionClosed(_) => "ConnectionClosedError",
            PyroError::Timeout(_) => "TimeoutError",
            PyroError::Protocol(_) => "ProtocolError",
            PyroError::MessageTooLarge { .. } => "MessageTooLargeError",
            PyroError::Serialize(_) => "SerializeError",
            PyroError::Daemon(_) => "DaemonError",
            PyroError::Pyro(_) => "PyroError",
            PyroError::Attribute(_) => "AttributeError",
            PyroError::Configuration(_) => "ConfigurationError",
        };
        let message = match self {
            PyroError::Communication(m)
            | PyroError::ConnectionClosed(m)
            | PyroError::Timeout(m)
            | PyroError::Protocol(m)
            | PyroError::Serialize(m)
            | PyroError::Daemon(m)
            | PyroError::Pyro(m)
            | PyroError::Attribute(m)
            | PyroError::Configuration(m) => m.clone(),
            other => other.to_string(),
        };
        RemoteException::new(kind, message)
    }
}

impl From<serde_json::Error> for PyroError {
    fn from(err: serde_json::Error) -> Self {
        PyroError::Serialize(err.to_string())
    }
}

impl From<RemoteException> for PyroError {
    fn from(exc: RemoteException) -> Self {
        PyroError::Remote(exc)
    }
}

/// Map IO errors to the communication error variants.
///
/// - Timeouts/would block -> `Timeout`
/// - Resets, aborts, EOF, broken pipes -> `ConnectionClosed`
/// - Anything else -> `Communication`
pub fn map_io_error(err: std::io::Error, context: &str) -> PyroError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            PyroError::Timeout(format!("{}: receiving/sending timed out", context))
        }
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => {
            PyroError::ConnectionClosed(format!("{}: connection lost", context))
        }
        _ => PyroError::Communication(format!("{}: {}", context, err)),
    }
}

pub type Result<T> = std::result::Result<T, PyroError>;
