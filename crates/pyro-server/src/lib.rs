//! Pyro Server
//!
//! This crate provides the dispatch side of the Pyro remote-object engine:
//! the [`Daemon`] that owns the object registry and processes requests, and
//! the transport servers that put a daemon on the network.
//!
//! # Components
//!
//! - **Objects**: [`RemoteObject`], [`ObjectClass`] and [`InstanceMode`]
//! - **Daemon**: registry, handshake, invocation, batches, oneway calls and
//!   item streams
//! - **Pool**: the elastic worker [`Pool`] behind the thread-pool server
//! - **Transport**: [`ThreadPoolServer`], [`MultiplexedServer`] and the
//!   config-driven [`Server`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pyro_common::{Config, Location, ObjectMeta, RemoteException};
//! use pyro_server::{CallArgs, Daemon, RegisterOptions, RemoteObject, Reply, Server};
//! use serde_json::json;
//!
//! struct Echo;
//!
//! impl RemoteObject for Echo {
//!     fn metadata(&self) -> ObjectMeta {
//!         ObjectMeta::new().method("echo")
//!     }
//!
//!     fn call(&self, _method: &str, args: CallArgs) -> Result<Reply, RemoteException> {
//!         Ok(json!(args.args).into())
//!     }
//! }
//!
//! let daemon = Daemon::new(Config::from_env().unwrap());
//! let server = Server::bind(Arc::clone(&daemon), &Location::Tcp { host: "localhost".into(), port: 9090 }).unwrap();
//! let uri = daemon.register(Arc::new(Echo), RegisterOptions::id("echo")).unwrap();
//! println!("serving {}", uri);
//! server.serve().unwrap();
//! ```

pub mod connection;
pub mod daemon;
pub mod object;
pub mod pool;
pub mod transport;

pub use connection::ClientConnection;
pub use daemon::{AcceptAll, Daemon, HandshakeValidator, OnewayErrorHandler, RegisterOptions};
pub use object::{CallArgs, InstanceMode, ObjectClass, RemoteObject, Reply};
pub use pool::{NoFreeWorkers, Pool, PoolConfig};
pub use transport::{MultiplexedServer, Server, ShutdownHandle, ThreadPoolServer};
