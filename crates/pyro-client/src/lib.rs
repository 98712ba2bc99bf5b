//! Pyro client: proxies for remote objects.
//!
//! A [`Proxy`] connects to a daemon, performs the handshake and forwards
//! method calls, attribute access, batches and item streams.

pub mod batch;
pub mod proxy;
pub mod resolver;
pub mod stream;

pub use batch::{BatchProxy, BatchResults};
pub use proxy::{CallOutcome, Proxy, ProxyState};
pub use resolver::{NameResolver, NoResolver, StaticResolver};
pub use stream::ItemStream;
