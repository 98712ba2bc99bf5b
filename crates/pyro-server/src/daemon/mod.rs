//! Pyro Daemon
//!
//! The daemon is the dispatch engine shared by both transport servers. It
//! owns the object registry, answers the connection handshake, decodes
//! invocations, resolves the target instance, runs the method and encodes
//! the result.
//!
//! # Architecture
//!
//! ```text
//! transport server ──► handshake() ──► CONNECT_OK / CONNECT_FAIL
//!        │
//!        └──────────► process_message() ──► resolve ──► RemoteObject::call
//!                                               │
//!                                               ├── oneway: helper thread
//!                                               ├── batch: in order, stop at first failure
//!                                               └── stream: StreamTable cursor
//! ```
//!
//! # Registry
//!
//! Entries map an object id to a shared instance, a class instantiated per
//! its [`InstanceMode`](crate::InstanceMode), or a weak handle. The registry
//! and the single-instance cache share one lock. Session instances live on
//! the [`ClientConnection`] instead.

mod builtin;
mod dispatch;
pub mod streams;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use pyro_common::protocol::{Annotations, Flags, Message, MessageType, WireOptions, HEADER_SIZE};
use pyro_common::transport::Transport;
use pyro_common::{
    Config, JsonSerializer, Location, ObjectMeta, PyroError, PyroUri, RemoteException, Result,
    Serializer, SerializerRegistry, DAEMON_NAME,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::ClientConnection;
use crate::object::{ObjectClass, RemoteObject};
use streams::StreamTable;

/// Handshake replies are padded up to this many bytes.
const MIN_HANDSHAKE_REPLY: usize = 64;

/// Decides whether a connecting client is accepted.
pub trait HandshakeValidator: Send + Sync {
    /// Returns the handshake response, or the reason for rejecting the client.
    fn validate(&self, client: &ClientConnection, data: &Value) -> std::result::Result<Value, String>;
}

/// Accepts every client and answers `"hello"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl HandshakeValidator for AcceptAll {
    fn validate(&self, _client: &ClientConnection, _data: &Value) -> std::result::Result<Value, String> {
        Ok(json!("hello"))
    }
}

/// Called with the object id, method name and error of a failed oneway call.
pub type OnewayErrorHandler = Arc<dyn Fn(&str, &str, &RemoteException) + Send + Sync>;

/// Options for registering an object or class.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Object id; generated as `obj_<32 hex>` when absent
    pub object_id: Option<String>,
    /// Replace an existing registration
    pub force: bool,
}

impl RegisterOptions {
    pub fn id(object_id: impl Into<String>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            force: false,
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Clone)]
enum Target {
    Builtin,
    Instance(Arc<dyn RemoteObject>),
    Class(ObjectClass),
    Weak(Weak<dyn RemoteObject>),
}

impl Target {
    fn same_as(&self, other: &Target) -> bool {
        match (self.object_ptr(), other.object_ptr()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Target::Class(a), Target::Class(b)) => a.same_factory(b),
                _ => false,
            },
        }
    }

    fn object_ptr(&self) -> Option<*const ()> {
        match self {
            Target::Instance(obj) => Some(Arc::as_ptr(obj) as *const ()),
            Target::Weak(weak) => Some(weak.as_ptr() as *const ()),
            _ => None,
        }
    }
}

/// A looked-up call target.
#[derive(Clone)]
pub(crate) enum Resolved {
    Builtin,
    Object(Arc<dyn RemoteObject>, ObjectMeta),
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Target>,
    /// Single-mode instances, keyed by object id
    singletons: HashMap<String, Arc<dyn RemoteObject>>,
}

impl Registry {
    fn prune_weak(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, target| match target {
            Target::Weak(weak) if weak.strong_count() == 0 => {
                tracing::debug!(object = %id, "Pruning dropped weak registration");
                false
            }
            _ => true,
        });
        before - self.entries.len()
    }
}

/// The dispatch engine.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pyro_common::{Config, ObjectMeta, RemoteException};
/// use pyro_server::{CallArgs, Daemon, RegisterOptions, RemoteObject, Reply};
/// use serde_json::json;
///
/// struct Greeter;
///
/// impl RemoteObject for Greeter {
///     fn metadata(&self) -> ObjectMeta {
///         ObjectMeta::new().method("greet")
///     }
///
///     fn call(&self, _method: &str, args: CallArgs) -> Result<Reply, RemoteException> {
///         Ok(json!(format!("hello, {}", args.str_arg(0)?)).into())
///     }
/// }
///
/// let daemon = Daemon::new(Config::default());
/// let uri = daemon.register(Arc::new(Greeter), RegisterOptions::id("greeter")).unwrap();
/// assert_eq!(uri.object(), "greeter");
/// ```
pub struct Daemon {
    config: Config,
    serializers: SerializerRegistry,
    registry: Mutex<Registry>,
    streams: StreamTable,
    location: RwLock<Location>,
    validator: RwLock<Arc<dyn HandshakeValidator>>,
    oneway_error_handler: RwLock<OnewayErrorHandler>,
    started: Instant,
}

impl Daemon {
    /// Creates a daemon with the JSON serializer.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_serializers(config, SerializerRegistry::new())
    }

    pub fn with_serializers(config: Config, serializers: SerializerRegistry) -> Arc<Self> {
        let mut registry = Registry::default();
        registry.entries.insert(DAEMON_NAME.to_string(), Target::Builtin);
        let location = Location::Tcp {
            host: config.host.clone(),
            port: 0,
        };
        let default_handler: OnewayErrorHandler = Arc::new(|object: &str, method: &str, exc: &RemoteException| {
            tracing::warn!(object, method, error = %exc, "Oneway call failed");
        });
        Arc::new(Self {
            config,
            serializers,
            registry: Mutex::new(registry),
            streams: StreamTable::new(),
            location: RwLock::new(location),
            validator: RwLock::new(Arc::new(AcceptAll) as Arc<dyn HandshakeValidator>),
            oneway_error_handler: RwLock::new(default_handler),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn wire(&self) -> WireOptions {
        self.config.wire()
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    pub fn location(&self) -> Location {
        self.location.read().clone()
    }

    /// Records where the daemon is reachable. Called by the server that binds it.
    pub fn set_location(&self, location: Location) {
        *self.location.write() = location;
    }

    /// URI of a registered (or to be registered) object id.
    pub fn uri_for(&self, object_id: &str) -> PyroUri {
        PyroUri::new(object_id, self.location())
    }

    pub fn set_handshake_validator(&self, validator: Arc<dyn HandshakeValidator>) {
        *self.validator.write() = validator;
    }

    pub fn set_oneway_error_handler(&self, handler: OnewayErrorHandler) {
        *self.oneway_error_handler.write() = handler;
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Registers a shared instance.
    ///
    /// # Errors
    ///
    /// Returns `Daemon` if the id or the object is already registered and
    /// `force` is not set.
    pub fn register(&self, object: Arc<dyn RemoteObject>, options: RegisterOptions) -> Result<PyroUri> {
        self.insert(Target::Instance(object), options)
    }

    /// Registers a class, instantiated per its instance mode.
    pub fn register_class(&self, class: ObjectClass, options: RegisterOptions) -> Result<PyroUri> {
        self.insert(Target::Class(class), options)
    }

    /// Registers an object without keeping it alive.
    ///
    /// The entry disappears once the last strong reference elsewhere is
    /// dropped; calls after that fail as for an unknown object.
    pub fn register_weak(&self, object: &Arc<dyn RemoteObject>, options: RegisterOptions) -> Result<PyroUri> {
        self.insert(Target::Weak(Arc::downgrade(object)), options)
    }

    fn insert(&self, target: Target, options: RegisterOptions) -> Result<PyroUri> {
        let object_id = options
            .object_id
            .unwrap_or_else(|| format!("obj_{}", Uuid::new_v4().simple()));
        if object_id == DAEMON_NAME {
            return Err(PyroError::Daemon(format!("the id {} is reserved", DAEMON_NAME)));
        }

        let mut registry = self.registry.lock();
        registry.prune_weak();
        if !options.force {
            if registry.entries.contains_key(&object_id) {
                return Err(PyroError::Daemon(format!(
                    "an object or class is already registered with id {}",
                    object_id
                )));
            }
            if let Some((existing, _)) = registry.entries.iter().find(|(_, t)| t.same_as(&target)) {
                return Err(PyroError::Daemon(format!(
                    "object or class is already registered as {}",
                    existing
                )));
            }
        }
        registry.singletons.remove(&object_id);
        registry.entries.insert(object_id.clone(), target);
        drop(registry);

        tracing::info!(object = %object_id, force = options.force, "Registered object");
        Ok(self.uri_for(&object_id))
    }

    /// Removes a registration. Returns whether the id was registered.
    ///
    /// # Errors
    ///
    /// Returns `Daemon` for the daemon's own id.
    pub fn unregister(&self, object_id: &str) -> Result<bool> {
        if object_id == DAEMON_NAME {
            return Err(PyroError::Daemon("cannot unregister the daemon object".to_string()));
        }
        let mut registry = self.registry.lock();
        let removed = registry.entries.remove(object_id);
        registry.singletons.remove(object_id);
        drop(registry);
        if removed.is_some() {
            tracing::info!(object = %object_id, "Unregistered object");
        }
        Ok(removed.is_some())
    }

    /// Removes every registration of an instance. Returns how many.
    pub fn unregister_object(&self, object: &Arc<dyn RemoteObject>) -> usize {
        let target = Target::Instance(object.clone());
        let mut registry = self.registry.lock();
        let before = registry.entries.len();
        registry.entries.retain(|_, t| !t.same_as(&target));
        before - registry.entries.len()
    }

    /// Ids of all live registrations, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut registry = self.registry.lock();
        registry.prune_weak();
        let mut ids: Vec<String> = registry.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Exposed surface of a registered object.
    ///
    /// # Errors
    ///
    /// Returns `Daemon` for unknown ids.
    pub fn metadata(&self, object_id: &str) -> Result<ObjectMeta> {
        let target = self.lookup(object_id)?;
        match target {
            Target::Builtin => Ok(builtin::metadata()),
            Target::Instance(obj) => Ok(obj.metadata()),
            Target::Class(class) => Ok(class.meta().clone()),
            Target::Weak(weak) => weak
                .upgrade()
                .map(|obj| obj.metadata())
                .ok_or_else(|| unknown_object(object_id)),
        }
    }

    fn lookup(&self, object_id: &str) -> Result<Target> {
        self.registry
            .lock()
            .entries
            .get(object_id)
            .cloned()
            .ok_or_else(|| unknown_object(object_id))
    }

    /// Finds the instance serving a call.
    pub(crate) fn resolve(&self, object_id: &str, client: &ClientConnection) -> Result<Resolved> {
        let mut registry = self.registry.lock();
        let target = registry
            .entries
            .get(object_id)
            .cloned()
            .ok_or_else(|| unknown_object(object_id))?;
        let object = match target {
            Target::Builtin => return Ok(Resolved::Builtin),
            Target::Instance(obj) => obj,
            Target::Weak(weak) => match weak.upgrade() {
                Some(obj) => obj,
                None => {
                    registry.entries.remove(object_id);
                    return Err(unknown_object(object_id));
                }
            },
            Target::Class(class) => {
                let meta = class.meta().clone();
                let instance = match class.mode() {
                    crate::InstanceMode::Single => {
                        if let Some(instance) = registry.singletons.get(object_id) {
                            return Ok(Resolved::Object(Arc::clone(instance), meta));
                        }
                        drop(registry);
                        tracing::debug!(class = class.name(), object = object_id, "Creating single instance");
                        let instance = class.instantiate().map_err(PyroError::Remote)?;
                        let mut registry = self.registry.lock();
                        // a concurrent re-registration may have replaced the class
                        let still_registered = matches!(
                            registry.entries.get(object_id),
                            Some(Target::Class(current)) if current.same_factory(&class)
                        );
                        if still_registered {
                            Arc::clone(registry.singletons.entry(object_id.to_string()).or_insert(instance))
                        } else {
                            instance
                        }
                    }
                    crate::InstanceMode::Session => {
                        drop(registry);
                        client.session_instance(object_id, &class).map_err(PyroError::Remote)?
                    }
                    crate::InstanceMode::PerCall => {
                        drop(registry);
                        class.instantiate().map_err(PyroError::Remote)?
                    }
                };
                return Ok(Resolved::Object(instance, meta));
            }
        };
        drop(registry);
        let meta = object.metadata();
        Ok(Resolved::Object(object, meta))
    }

    /// Reads a CONNECT message and answers it.
    ///
    /// Returns whether the client was accepted. A rejected client gets a
    /// CONNECT_FAIL with the reason and its transport is closed.
    pub fn handshake<T: Transport + ?Sized>(&self, client: &ClientConnection, transport: &mut T) -> Result<bool> {
        let msg = Message::recv(transport, Some(&[MessageType::Connect]), &self.wire())?;
        let (reply, accepted) = self.handshake_response(client, &msg)?;
        transport.send(&reply)?;
        if !accepted {
            transport.close();
        }
        Ok(accepted)
    }

    /// Builds the encoded CONNECT_OK or CONNECT_FAIL reply to a CONNECT message.
    pub fn handshake_response(&self, client: &ClientConnection, msg: &Message) -> Result<(Vec<u8>, bool)> {
        let serializer = self
            .serializers
            .get(msg.serializer_id)
            .unwrap_or_else(|_| Arc::new(JsonSerializer) as Arc<dyn Serializer>);

        let outcome = self.validate_handshake(client, msg);
        let (msg_type, body) = match outcome {
            Ok(body) => {
                tracing::debug!(peer = client.peer(), "Handshake accepted");
                (MessageType::ConnectOk, body)
            }
            Err(reason) => {
                tracing::info!(peer = client.peer(), reason = %reason, "Handshake rejected");
                (MessageType::ConnectFail, Value::String(reason))
            }
        };
        let reply = self.connect_reply(msg, &*serializer, msg_type, &body)?;
        Ok((reply, msg_type == MessageType::ConnectOk))
    }

    /// Builds a CONNECT_FAIL reply without looking at the handshake.
    ///
    /// Used by servers that have to turn a client away before the daemon
    /// sees it.
    pub fn refuse_connect(&self, msg: &Message, reason: &str) -> Result<Vec<u8>> {
        let serializer = self
            .serializers
            .get(msg.serializer_id)
            .unwrap_or_else(|_| Arc::new(JsonSerializer) as Arc<dyn Serializer>);
        self.connect_reply(msg, &*serializer, MessageType::ConnectFail, &json!(reason))
    }

    fn connect_reply(
        &self,
        msg: &Message,
        serializer: &dyn Serializer,
        msg_type: MessageType,
        body: &Value,
    ) -> Result<Vec<u8>> {
        let payload = serializer.dumps(body)?;

        let mut annotations = Annotations::new();
        if let Some(correlation) = msg.annotations.get(Annotations::CORRELATION_ID) {
            annotations.insert(Annotations::CORRELATION_ID, correlation.to_vec())?;
        }
        let size = HEADER_SIZE + payload.len() + annotations.wire_size();
        if size < MIN_HANDSHAKE_REPLY {
            let padding = (MIN_HANDSHAKE_REPLY - size).saturating_sub(8);
            annotations.insert(Annotations::PADDING, vec![0u8; padding])?;
        }

        Message::new(msg_type, payload, serializer.id(), Flags::EMPTY, msg.seq)
            .with_annotations(annotations)
            .to_bytes(&self.wire())
    }

    fn validate_handshake(&self, client: &ClientConnection, msg: &Message) -> std::result::Result<Value, String> {
        let serializer = self.serializers.get(msg.serializer_id).map_err(|e| e.to_string())?;
        let data = serializer.loads(&msg.payload).map_err(|e| e.to_string())?;
        let handshake = data.get("handshake").cloned().unwrap_or(Value::Null);
        let object_id = data
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| "handshake does not name an object".to_string())?;
        client.set_handshake_data(handshake.clone());

        let validator = self.validator.read().clone();
        let response = catch_unwind(AssertUnwindSafe(|| validator.validate(client, &handshake)))
            .unwrap_or_else(|panic| Err(format!("handshake validator panicked: {}", panic_message(&*panic))))?;
        let meta = self.metadata(object_id).map_err(|e| e.to_string())?;
        Ok(json!({ "handshake": response, "meta": meta }))
    }

    /// Expires item streams and prunes dropped weak registrations.
    ///
    /// Run periodically by both servers.
    pub fn housekeeping(&self) {
        let expired = self.streams.expire(
            self.config.iter_stream_lifetime,
            self.config.iter_stream_linger,
            Instant::now(),
        );
        let pruned = self.registry.lock().prune_weak();
        if expired > 0 || pruned > 0 {
            tracing::debug!(expired, pruned, "Housekeeping");
        }
    }

    /// Releases everything tied to a client that went away.
    pub fn client_disconnected(&self, client: &ClientConnection) {
        self.streams
            .client_disconnected(client.id(), self.config.iter_stream_linger);
        client.close();
        tracing::debug!(peer = client.peer(), "Client disconnected");
    }

    /// Number of open item streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// One-line description of this daemon.
    pub fn info(&self) -> String {
        let count = self.registry.lock().entries.len();
        format!(
            "{} bound on {}, {} objects registered, servertype {:?}",
            DAEMON_NAME,
            self.location(),
            count,
            self.config.server_type
        )
    }

    /// Clears every registration except the daemon object, and all streams.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.entries.retain(|_, target| matches!(target, Target::Builtin));
        registry.singletons.clear();
        drop(registry);
        self.streams.clear();
        tracing::info!(location = %self.location(), "Daemon closed");
    }

    pub(crate) fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub(crate) fn report_oneway_error(&self, object_id: &str, method: &str, exc: &RemoteException) {
        let handler = self.oneway_error_handler.read().clone();
        handler(object_id, method, exc);
    }
}

fn unknown_object(object_id: &str) -> PyroError {
    PyroError::Daemon(format!("unknown object '{}'", object_id))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
