//! Per-call context.
//!
//! Each thread carries one [`CallContext`]. The daemon resets it at the start
//! of every request, so two calls never observe each other's state: pool
//! workers own their thread outright, and the multiplexed server processes
//! a request from start to reply without yielding. Oneway helper threads get
//! a copy of the context that was current when the request arrived.
//!
//! On the client side the proxy reads the outgoing correlation id from the
//! context and stores the annotations of the last reply into it.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::error::{PyroError, Result};
use crate::protocol::message::{Annotations, Flags};
use crate::serializer::JsonSerializer;

/// A resource closed together with the client connection it belongs to.
pub trait TrackedResource: Send + Sync {
    fn close(&self);
}

/// Resources registered on one client connection.
#[derive(Default)]
pub struct ResourceTracker {
    resources: Mutex<Vec<Arc<dyn TrackedResource>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, resource: Arc<dyn TrackedResource>) {
        let mut resources = self.resources.lock();
        if !resources.iter().any(|r| Arc::ptr_eq(r, &resource)) {
            resources.push(resource);
        }
    }

    pub fn untrack(&self, resource: &Arc<dyn TrackedResource>) {
        self.resources.lock().retain(|r| !Arc::ptr_eq(r, resource));
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and forgets every tracked resource.
    pub fn close_all(&self) {
        let resources = std::mem::take(&mut *self.resources.lock());
        for resource in resources {
            resource.close();
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Server-side view of the client connection a call arrived on.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer: String,
    resources: Arc<ResourceTracker>,
}

impl ConnectionHandle {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            resources: Arc::new(ResourceTracker::new()),
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn resources(&self) -> &Arc<ResourceTracker> {
        &self.resources
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// State of the call currently executing on this thread.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub seq: u16,
    pub flags: Flags,
    pub serializer_id: u8,
    /// Annotations sent with outgoing messages
    pub annotations: Annotations,
    /// Annotations received with the last reply
    pub response_annotations: Annotations,
    pub correlation_id: Option<Uuid>,
    /// Set by the daemon while serving a request
    pub client: Option<ConnectionHandle>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            seq: 0,
            flags: Flags::EMPTY,
            serializer_id: JsonSerializer::ID,
            annotations: Annotations::new(),
            response_annotations: Annotations::new(),
            correlation_id: None,
            client: None,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<CallContext> = RefCell::new(CallContext::default());
}

/// Runs `f` with mutable access to this thread's context.
///
/// `f` must not call back into the context functions of this module.
pub fn with_current_context<R>(f: impl FnOnce(&mut CallContext) -> R) -> R {
    CURRENT.with(|ctx| f(&mut ctx.borrow_mut()))
}

/// A snapshot of this thread's context.
pub fn current_context() -> CallContext {
    with_current_context(|ctx| ctx.clone())
}

/// Replaces this thread's context.
pub fn set_current_context(context: CallContext) {
    with_current_context(|ctx| *ctx = context);
}

/// Restores the default context.
pub fn reset_current_context() {
    set_current_context(CallContext::default());
}

/// Ties a resource to the client connection of the current call.
///
/// # Errors
///
/// Returns `Pyro` when called outside a call served by a daemon.
pub fn track_resource(resource: Arc<dyn TrackedResource>) -> Result<()> {
    let client = with_current_context(|ctx| ctx.client.clone()).ok_or_else(no_connection)?;
    client.resources.track(resource);
    Ok(())
}

/// Releases a resource from the current client connection.
///
/// # Errors
///
/// Returns `Pyro` when called outside a call served by a daemon.
pub fn untrack_resource(resource: &Arc<dyn TrackedResource>) -> Result<()> {
    let client = with_current_context(|ctx| ctx.client.clone()).ok_or_else(no_connection)?;
    client.resources.untrack(resource);
    Ok(())
}

fn no_connection() -> PyroError {
    PyroError::Pyro("no active connection, cannot track resources outside a remote call".to_string())
}
