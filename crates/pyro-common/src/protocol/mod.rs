//! Pyro Protocol Definitions
//!
//! This module defines the wire messages and the error types shared by
//! clients and daemons.
//!
//! # Components
//!
//! - **[`Message`]**: the binary envelope (header, annotations, payload)
//! - **[`RemoteException`]**: an exception raised by remote code, carried as data
//! - **[`ObjectMeta`]**: the exposed surface of a remote object
//! - **[`PyroError`]**: the error taxonomy

pub mod error;
pub mod exception;
pub mod message;
pub mod meta;

pub use error::{map_io_error, PyroError, Result};
pub use exception::{RemoteException, EXCEPTION_MARKER, STOP_ITERATION};
pub use message::{
    Annotations, Flags, Header, Message, MessageType, WireOptions, COMPRESSION_THRESHOLD,
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, MAGIC, PROTOCOL_VERSION,
};
pub use meta::{is_private_name, ObjectMeta};
