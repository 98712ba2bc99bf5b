//! Pyro Transport Layer
//!
//! This module provides the byte-channel abstraction the codec reads from and
//! writes to.
//!
//! # Architecture
//!
//! - **[`Transport`]**: a duplex byte channel with exact-length reads
//! - **[`Connection`]**: the socket-backed transport (TCP or Unix domain),
//!   used by proxies and by the thread-pool server
//!
//! The multiplexed server does not go through [`Transport`]; it reads with
//! [`Message::recv_async`](crate::protocol::Message::recv_async) directly from
//! tokio sockets.
//!
//! # Example
//!
//! ```no_run
//! use pyro_common::protocol::{Flags, Message, MessageType, WireOptions};
//! use pyro_common::transport::{Connection, Transport};
//! use pyro_common::Location;
//!
//! let location = Location::Tcp { host: "127.0.0.1".into(), port: 9090 };
//! let mut conn = Connection::connect(&location, None).unwrap();
//!
//! let ping = Message::new(MessageType::Ping, b"ping".to_vec(), 2, Flags::EMPTY, 1);
//! conn.send(&ping.to_bytes(&WireOptions::default()).unwrap()).unwrap();
//! let reply = Message::recv(&mut conn, Some(&[MessageType::Ping]), &WireOptions::default()).unwrap();
//! ```

pub mod connection;

pub use connection::Connection;

use crate::protocol::error::Result;

/// A duplex byte channel.
///
/// Implementations close themselves on I/O errors they cannot recover from;
/// callers treat any error from `send`/`recv` as fatal for the channel.
pub trait Transport {
    /// Writes all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Reads exactly `size` bytes or fails.
    fn recv(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Closes the channel. Closing twice is a no-op.
    fn close(&mut self);
}

#[cfg(test)]
pub(crate) use memory::MemoryTransport;
