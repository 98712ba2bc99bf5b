//! Pyro Common Types and Transport
//!
//! This crate provides the wire protocol and the shared building blocks of
//! the Pyro remote-object engine.
//!
//! # Overview
//!
//! Pyro lets a caller invoke methods on an object living in another process
//! as if it were local. This crate contains everything both ends share:
//!
//! - **Protocol Layer**: the binary message envelope, remote exceptions,
//!   object metadata and the error taxonomy
//! - **Transport Layer**: the [`Transport`](transport::Transport) seam and
//!   the socket-backed [`Connection`](transport::Connection)
//! - **Call Context**: per-thread call state and tracked resources
//! - **Serializers**, **URIs** and **Configuration**
//!
//! # Architecture
//!
//! - **Transport**: TCP or Unix domain sockets
//! - **Message Format**: 22 byte header, annotation chunks, payload
//! - **Serialization**: pluggable by id, JSON by default
//! - **Max Message Size**: 100 MiB by default
//!
//! # Example
//!
//! ```
//! use pyro_common::{Config, PyroUri};
//! use pyro_common::protocol::{Flags, Message, MessageType};
//!
//! let config = Config::default();
//! let uri: PyroUri = "PYRO:calculator@localhost:9090".parse().unwrap();
//!
//! let msg = Message::new(MessageType::Ping, b"ping".to_vec(), config.serializer, Flags::EMPTY, 1);
//! let bytes = msg.to_bytes(&config.wire()).unwrap();
//! assert_eq!(&bytes[..4], b"PYRO");
//! assert_eq!(uri.object(), "calculator");
//! ```

pub mod config;
pub mod context;
pub mod protocol;
pub mod serializer;
pub mod transport;
pub mod uri;

pub use config::{Config, ServerType};
pub use context::{CallContext, ConnectionHandle, ResourceTracker, TrackedResource};
pub use protocol::{ObjectMeta, PyroError, RemoteException, Result};
pub use serializer::{CallRequest, JsonSerializer, SerializedBlob, Serializer, SerializerRegistry};
pub use uri::{Location, PyroUri, UriProtocol};

/// Object id of the daemon's built-in object.
pub const DAEMON_NAME: &str = "Pyro.Daemon";
