use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pyro_common::{ConnectionHandle, RemoteException};
use serde_json::Value;

use crate::object::{ObjectClass, RemoteObject};

/// Server-side state of one client connection.
///
/// Owns the session instances created for this client (keyed by object
/// id) and, through its [`ConnectionHandle`], the resources tracked by
/// calls made on it. Both go away in [`close`](Self::close).
pub struct ClientConnection {
    handle: ConnectionHandle,
    sessions: Mutex<HashMap<String, Arc<dyn RemoteObject>>>,
    handshake: Mutex<Option<Value>>,
}

impl ClientConnection {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            handle: ConnectionHandle::new(peer),
            sessions: Mutex::new(HashMap::new()),
            handshake: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn peer(&self) -> &str {
        self.handle.peer()
    }

    /// Handshake data the client sent on connect.
    pub fn handshake_data(&self) -> Option<Value> {
        self.handshake.lock().clone()
    }

    pub(crate) fn set_handshake_data(&self, data: Value) {
        *self.handshake.lock() = Some(data);
    }

    /// The session instance of the class registered as `object_id`,
    /// created on first use.
    ///
    /// The factory runs without holding the session lock.
    pub fn session_instance(
        &self,
        object_id: &str,
        class: &ObjectClass,
    ) -> Result<Arc<dyn RemoteObject>, RemoteException> {
        if let Some(instance) = self.sessions.lock().get(object_id) {
            return Ok(Arc::clone(instance));
        }
        tracing::debug!(class = class.name(), object = object_id, peer = self.peer(), "Creating session instance");
        let instance = class.instantiate()?;
        Ok(Arc::clone(
            self.sessions.lock().entry(object_id.to_string()).or_insert(instance),
        ))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drops the session instances and closes the tracked resources.
    pub fn close(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        drop(sessions);
        self.handle.resources().close_all();
    }
}
