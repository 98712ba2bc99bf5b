//! Object references.
//!
//! A [`PyroUri`] names one remote object:
//!
//! ```text
//! PYRO:<object>@<host>:<port>        direct, TCP
//! PYRO:<object>@[<ipv6>]:<port>      direct, TCP over IPv6
//! PYRO:<object>@./u:<socket-path>    direct, Unix domain socket
//! PYRONAME:<name>                    indirect, resolved by the name server
//! PYRONAME:<name>@<host>:<port>      indirect, with an explicit name server
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::error::{PyroError, Result};

/// Where a daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Location {
    /// Parses `host:port`, `[ipv6]:port` or `./u:path`.
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(path) = text.strip_prefix("./u:") {
            if path.is_empty() {
                return Err(invalid(text));
            }
            return Ok(Location::Unix { path: PathBuf::from(path) });
        }
        let (host, port) = text.rsplit_once(':').ok_or_else(|| invalid(text))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid(text));
        }
        let port = port.parse::<u16>().map_err(|_| invalid(text))?;
        Ok(Location::Tcp { host: host.to_string(), port })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Location::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Location::Unix { path } => write!(f, "./u:{}", path.display()),
        }
    }
}

/// URI protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriProtocol {
    /// Direct reference to an object on a known daemon
    Pyro,
    /// Symbolic name looked up through the naming service
    PyroName,
}

impl UriProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            UriProtocol::Pyro => "PYRO",
            UriProtocol::PyroName => "PYRONAME",
        }
    }
}

/// An immutable reference to a remote object.
///
/// # Example
///
/// ```
/// use pyro_common::PyroUri;
///
/// let uri: PyroUri = "PYRO:calculator@localhost:9090".parse().unwrap();
/// assert_eq!(uri.object(), "calculator");
/// assert_eq!(uri.to_string(), "PYRO:calculator@localhost:9090");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PyroUri {
    protocol: UriProtocol,
    object: String,
    location: Option<Location>,
}

impl PyroUri {
    /// Builds a direct reference.
    pub fn new(object: impl Into<String>, location: Location) -> Self {
        Self {
            protocol: UriProtocol::Pyro,
            object: object.into(),
            location: Some(location),
        }
    }

    /// Builds a symbolic reference, optionally pinned to a name server.
    pub fn name(name: impl Into<String>, name_server: Option<Location>) -> Self {
        Self {
            protocol: UriProtocol::PyroName,
            object: name.into(),
            location: name_server,
        }
    }

    /// Parses a URI string.
    ///
    /// # Errors
    ///
    /// Returns `Pyro("invalid uri ...")` on bad syntax.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (protocol, rest) = text.split_once(':').ok_or_else(|| invalid(text))?;
        let protocol = match protocol.to_ascii_uppercase().as_str() {
            "PYRO" => UriProtocol::Pyro,
            "PYRONAME" => UriProtocol::PyroName,
            _ => return Err(invalid(text)),
        };
        let (object, location) = match rest.split_once('@') {
            Some((object, location)) => (object, Some(Location::parse(location)?)),
            None => (rest, None),
        };
        if object.is_empty() || object.chars().any(char::is_whitespace) {
            return Err(invalid(text));
        }
        if protocol == UriProtocol::Pyro && location.is_none() {
            return Err(invalid(text));
        }
        Ok(Self {
            protocol,
            object: object.to_string(),
            location,
        })
    }

    pub fn protocol(&self) -> UriProtocol {
        self.protocol
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn is_direct(&self) -> bool {
        self.protocol == UriProtocol::Pyro
    }
}

impl FromStr for PyroUri {
    type Err = PyroError;

    fn from_str(s: &str) -> Result<Self> {
        PyroUri::parse(s)
    }
}

impl fmt::Display for PyroUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol.as_str(), self.object)?;
        if let Some(location) = &self.location {
            write!(f, "@{}", location)?;
        }
        Ok(())
    }
}

fn invalid(text: &str) -> PyroError {
    PyroError::Pyro(format!("invalid uri: {}", text))
}
