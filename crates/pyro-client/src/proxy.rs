//! Client-side proxy.
//!
//! A [`Proxy`] stands in for one remote object. It connects lazily, caches
//! the object's metadata from the handshake and validates every method and
//! attribute name against it before anything goes on the wire.
//!
//! # State
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNECT_OK──► Connected
//!      ▲                           │                         │
//!      └────── CONNECT_FAIL ───────┘                         │
//!      └────── communication failure / release() ────────────┘
//! ```
//!
//! # Ownership
//!
//! A proxy belongs to the thread that created it. Calls from any other
//! thread fail with `PyroError::Pyro` until that thread calls
//! [`Proxy::transfer_ownership`]. This keeps one connection from being
//! driven by two threads, which would interleave replies.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use pyro_common::context::with_current_context;
use pyro_common::protocol::{is_private_name, Annotations, Flags, Message, MessageType};
use pyro_common::serializer::BATCH_METHOD;
use pyro_common::transport::{Connection, Transport};
use pyro_common::{
    Config, ObjectMeta, PyroError, PyroUri, RemoteException, Result, SerializedBlob, Serializer,
    SerializerRegistry, DAEMON_NAME,
};
use serde_json::{json, Map, Value};

use crate::batch::{BatchCall, BatchProxy};
use crate::resolver::{NameResolver, NoResolver};
use crate::stream::ItemStream;

/// Pause between connection attempts in [`Proxy::reconnect`].
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connection state of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of a remote call.
pub enum CallOutcome {
    Value(Value),
    /// The method returned an iterator; items are fetched one call at a time
    Stream(ItemStream),
}

impl CallOutcome {
    /// The plain value.
    ///
    /// # Errors
    ///
    /// Returns `Pyro` if the call produced an item stream.
    pub fn into_value(self) -> Result<Value> {
        match self {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Stream(stream) => Err(PyroError::Pyro(format!(
                "call returned item stream {} instead of a value",
                stream.id()
            ))),
        }
    }

    /// The item stream.
    ///
    /// # Errors
    ///
    /// Returns `Pyro` if the call produced a plain value.
    pub fn into_stream(self) -> Result<ItemStream> {
        match self {
            CallOutcome::Stream(stream) => Ok(stream),
            CallOutcome::Value(_) => Err(PyroError::Pyro("call did not return an item stream".to_string())),
        }
    }
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            CallOutcome::Stream(stream) => f.debug_tuple("Stream").field(&stream.id()).finish(),
        }
    }
}

/// What a reply decoded to, before streams are bound to the proxy.
pub(crate) enum Decoded {
    Value(Value),
    Stream(String),
}

/// Proxy state shared with the item streams it hands out.
pub(crate) struct ProxyInner {
    uri: PyroUri,
    config: Config,
    serializers: Arc<SerializerRegistry>,
    serializer: Arc<dyn Serializer>,
    resolver: Arc<dyn NameResolver>,
    conn: Option<Connection>,
    state: ProxyState,
    pub(crate) seq: u16,
    /// Direct reference the connection was made to
    target: Option<PyroUri>,
    meta: Option<ObjectMeta>,
    handshake: Value,
    handshake_response: Option<Value>,
    annotations: Annotations,
    response_annotations: Annotations,
    timeout: Option<Duration>,
    max_retries: u32,
    owner: ThreadId,
}

impl ProxyInner {
    pub(crate) fn check_owner(&self) -> Result<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(PyroError::Pyro(format!(
                "the calling thread is not the owner of this proxy for {}; transfer ownership first",
                self.uri
            )))
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.state = ProxyState::Connecting;
        match self.open() {
            Ok(()) => {
                self.state = ProxyState::Connected;
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                self.state = ProxyState::Disconnected;
                Err(e)
            }
        }
    }

    fn resolve(&self) -> Result<PyroUri> {
        if self.uri.is_direct() {
            return Ok(self.uri.clone());
        }
        let resolved = self.resolver.lookup(self.uri.object())?;
        if !resolved.is_direct() {
            return Err(PyroError::Pyro(format!(
                "name {} resolved to another indirect reference {}",
                self.uri.object(),
                resolved
            )));
        }
        tracing::debug!(name = self.uri.object(), uri = %resolved, "Resolved name");
        Ok(resolved)
    }

    /// Connects and performs the handshake.
    fn open(&mut self) -> Result<()> {
        let target = self.resolve()?;
        let location = target
            .location()
            .cloned()
            .ok_or_else(|| PyroError::Pyro(format!("reference {} has no location", target)))?;
        let wire = self.config.wire();

        let mut conn = Connection::connect(&location, self.timeout)?;
        let body = json!({ "handshake": self.handshake, "object": target.object() });
        let connect = Message::new(
            MessageType::Connect,
            self.serializer.dumps(&body)?,
            self.serializer.id(),
            Flags::EMPTY,
            0,
        )
        .with_annotations(self.outgoing_annotations()?);
        conn.send(&connect.to_bytes(&wire)?)?;

        let reply = Message::recv(
            &mut conn,
            Some(&[MessageType::ConnectOk, MessageType::ConnectFail]),
            &wire,
        )?;
        let body = self.serializers.get(reply.serializer_id)?.loads(&reply.payload)?;
        if reply.msg_type == MessageType::ConnectFail {
            conn.close();
            let reason = body.as_str().map(str::to_string).unwrap_or_else(|| body.to_string());
            tracing::info!(uri = %self.uri, reason = %reason, "Connection rejected");
            return Err(PyroError::Communication(format!(
                "connection to {} rejected: {}",
                self.uri, reason
            )));
        }

        let meta = body
            .get("meta")
            .cloned()
            .ok_or_else(|| PyroError::Protocol("handshake response carries no metadata".to_string()))?;
        self.meta = Some(serde_json::from_value(meta)?);
        self.handshake_response = body.get("handshake").cloned();
        tracing::debug!(uri = %self.uri, peer = conn.peer(), "Connected");
        self.conn = Some(conn);
        self.target = Some(target);
        Ok(())
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            tracing::debug!(uri = %self.uri, "Disconnected");
        }
        self.state = ProxyState::Disconnected;
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// User annotations plus the correlation id of the current context.
    fn outgoing_annotations(&self) -> Result<Annotations> {
        let mut annotations = self.annotations.clone();
        if let Some(correlation) = with_current_context(|ctx| ctx.correlation_id) {
            annotations.insert(Annotations::CORRELATION_ID, correlation.as_bytes().to_vec())?;
        }
        Ok(annotations)
    }

    /// Object id on the connected daemon.
    fn object_id(&self) -> String {
        self.target
            .as_ref()
            .map(|t| t.object().to_string())
            .unwrap_or_else(|| self.uri.object().to_string())
    }

    /// Checks a method name against the cached metadata. Returns whether
    /// the method is oneway.
    fn check_method(&self, method: &str) -> Result<bool> {
        let meta = self.metadata()?;
        if is_private_name(method) || !meta.has_method(method) {
            return Err(PyroError::Attribute(format!(
                "remote object '{}' has no exposed attribute or method '{}'",
                self.uri, method
            )));
        }
        Ok(meta.is_oneway(method))
    }

    fn check_attribute(&self, name: &str) -> Result<()> {
        let meta = self.metadata()?;
        if is_private_name(name) || !meta.has_attr(name) {
            return Err(PyroError::Attribute(format!(
                "remote object '{}' has no exposed attribute '{}'",
                self.uri, name
            )));
        }
        Ok(())
    }

    fn metadata(&self) -> Result<&ObjectMeta> {
        self.meta
            .as_ref()
            .ok_or_else(|| PyroError::Pyro("proxy has no metadata, connect first".to_string()))
    }

    /// Sends an INVOKE and returns the reply, or `None` for oneway calls.
    fn invoke(
        &mut self,
        object: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        flags: Flags,
    ) -> Result<Option<Message>> {
        self.ensure_connected()?;
        let payload = self.serializer.dumps_call(object, method, args, kwargs)?;
        let seq = self.next_seq();
        let msg = Message::new(MessageType::Invoke, payload, self.serializer.id(), flags, seq)
            .with_annotations(self.outgoing_annotations()?);
        self.transact(msg, MessageType::Result)
    }

    /// Writes a request and reads the matching reply.
    ///
    /// Any communication failure and any out-of-sequence reply close the
    /// connection before the error is returned.
    fn transact(&mut self, msg: Message, reply_type: MessageType) -> Result<Option<Message>> {
        let wire = self.config.wire();
        let bytes = msg.to_bytes(&wire)?;
        let oneway = msg.flags.contains(Flags::ONEWAY);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| PyroError::ConnectionClosed("proxy is not connected".to_string()))?;

        self.response_annotations = Annotations::new();
        with_current_context(|ctx| ctx.response_annotations = Annotations::new());
        let result = conn.send(&bytes).and_then(|_| {
            if oneway {
                Ok(None)
            } else {
                Message::recv(conn, Some(&[reply_type]), &wire).map(Some)
            }
        });
        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(e) => {
                if e.is_communication() {
                    self.disconnect();
                }
                return Err(e);
            }
        };

        if reply.seq != msg.seq {
            self.disconnect();
            return Err(PyroError::Protocol(format!(
                "result message out of sync: sent seq {}, received seq {}",
                msg.seq, reply.seq
            )));
        }
        self.response_annotations = reply.annotations.clone();
        with_current_context(|ctx| ctx.response_annotations = reply.annotations.clone());
        Ok(Some(reply))
    }

    /// Decodes a RESULT payload, turning an exception reply into
    /// `PyroError::Remote`.
    fn decode_value(&self, reply: &Message, serializer_id: u8) -> Result<Value> {
        let serializer = if reply.serializer_id == serializer_id {
            self.serializers.get(serializer_id)?
        } else if reply.flags.contains(Flags::EXCEPTION) {
            // A server that cannot encode an exception falls back to its default serializer.
            self.serializers.get(reply.serializer_id)?
        } else {
            return Err(PyroError::Serialize(format!(
                "invalid serializer in response: expected {}, got {}",
                serializer_id, reply.serializer_id
            )));
        };
        let value = serializer.loads(&reply.payload)?;
        if reply.flags.contains(Flags::EXCEPTION) {
            let exc = RemoteException::from_value(&value)
                .unwrap_or_else(|| RemoteException::pyro_error(format!("undecodable remote exception: {}", value)));
            tracing::debug!(kind = %exc.kind, message = %exc.message, "Remote exception");
            return Err(PyroError::Remote(exc));
        }
        Ok(value)
    }

    fn decode(&self, reply: &Message, serializer_id: u8) -> Result<Decoded> {
        let value = self.decode_value(reply, serializer_id)?;
        if !reply.flags.contains(Flags::ITEM_STREAM_RESULT) {
            return Ok(Decoded::Value(value));
        }
        let id = reply
            .annotations
            .get(Annotations::STREAM_ID)
            .and_then(|id| String::from_utf8(id.to_vec()).ok())
            .ok_or_else(|| PyroError::Protocol("item stream result without stream id".to_string()))?;
        Ok(Decoded::Stream(id))
    }

    fn call(&mut self, method: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<Decoded> {
        self.ensure_connected()?;
        let oneway = self.check_method(method)?;
        let flags = if oneway { Flags::ONEWAY } else { Flags::EMPTY };
        let object = self.object_id();
        match self.invoke(&object, method, args, kwargs, flags)? {
            Some(reply) => self.decode(&reply, self.serializer.id()),
            None => Ok(Decoded::Value(Value::Null)),
        }
    }

    /// Calls a method of the daemon object on this proxy's connection.
    pub(crate) fn call_daemon(&mut self, method: &str, args: &[Value], oneway: bool) -> Result<Value> {
        let flags = if oneway { Flags::ONEWAY } else { Flags::EMPTY };
        match self.invoke(DAEMON_NAME, method, args, &Map::new(), flags)? {
            Some(reply) => self.decode_value(&reply, self.serializer.id()),
            None => Ok(Value::Null),
        }
    }

    /// A fresh proxy to the daemon object this proxy is connected to.
    pub(crate) fn daemon_proxy(&self) -> Result<Proxy> {
        let location = self
            .target
            .as_ref()
            .and_then(|t| t.location())
            .cloned()
            .ok_or_else(|| PyroError::Pyro("proxy was never connected".to_string()))?;
        let proxy = Proxy::with_config(PyroUri::new(DAEMON_NAME, location), self.config.clone())?
            .with_serializers(Arc::clone(&self.serializers))?;
        proxy.set_handshake(self.handshake.clone());
        Ok(proxy)
    }
}

/// A client-side stand-in for one remote object.
///
/// # Example
///
/// ```no_run
/// use pyro_client::Proxy;
/// use serde_json::json;
///
/// let proxy = Proxy::new("PYRO:calculator@localhost:9090".parse().unwrap()).unwrap();
/// let product = proxy.call_value("multiply", vec![json!(7), json!(6)]).unwrap();
/// assert_eq!(product, json!(42));
/// ```
pub struct Proxy {
    inner: Arc<Mutex<ProxyInner>>,
}

impl Proxy {
    /// A proxy with the default configuration. Does not connect yet.
    pub fn new(uri: PyroUri) -> Result<Self> {
        Self::with_config(uri, Config::default())
    }

    /// A proxy with an explicit configuration. Does not connect yet.
    ///
    /// # Errors
    ///
    /// Returns `Serialize` if the configured serializer id is unknown.
    pub fn with_config(uri: PyroUri, config: Config) -> Result<Self> {
        let serializers = Arc::new(SerializerRegistry::new());
        let serializer = serializers.get(config.serializer)?;
        let inner = ProxyInner {
            uri,
            timeout: config.comm_timeout,
            max_retries: config.max_retries,
            config,
            serializers,
            serializer,
            resolver: Arc::new(NoResolver),
            conn: None,
            state: ProxyState::Disconnected,
            seq: 0,
            target: None,
            meta: None,
            handshake: Value::Null,
            handshake_response: None,
            annotations: Annotations::new(),
            response_annotations: Annotations::new(),
            owner: thread::current().id(),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Replaces the serializer registry.
    ///
    /// # Errors
    ///
    /// Returns `Serialize` if the configured serializer id is not in `serializers`.
    pub fn with_serializers(self, serializers: Arc<SerializerRegistry>) -> Result<Self> {
        {
            let mut inner = self.inner.lock();
            inner.serializer = serializers.get(inner.config.serializer)?;
            inner.serializers = serializers;
        }
        Ok(self)
    }

    /// Sets the resolver used for `PYRONAME:` references.
    pub fn with_resolver(self, resolver: Arc<dyn NameResolver>) -> Self {
        self.inner.lock().resolver = resolver;
        self
    }

    pub fn uri(&self) -> PyroUri {
        self.inner.lock().uri.clone()
    }

    pub fn state(&self) -> ProxyState {
        self.inner.lock().state
    }

    /// Makes the calling thread the owner of this proxy.
    pub fn transfer_ownership(&self) {
        self.inner.lock().owner = thread::current().id();
    }

    /// Connects now instead of on the first call. No-op when connected.
    pub fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_owner()?;
        inner.ensure_connected()
    }

    /// Closes the connection. The next call reconnects.
    pub fn release(&self) {
        self.inner.lock().disconnect();
    }

    /// Drops the connection and connects again, trying up to `tries` times
    /// with a pause between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once all attempts have failed.
    pub fn reconnect(&self, tries: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_owner()?;
        inner.disconnect();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match inner.ensure_connected() {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= tries.max(1) => return Err(e),
                Err(e) => {
                    tracing::info!(uri = %inner.uri, attempt, error = %e, "Reconnect failed, retrying");
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }

    /// Data sent with the next handshake.
    pub fn set_handshake(&self, data: Value) {
        self.inner.lock().handshake = data;
    }

    /// What the daemon answered to the last handshake.
    pub fn handshake_response(&self) -> Option<Value> {
        self.inner.lock().handshake_response.clone()
    }

    /// Sets the socket timeout, also on an open connection.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.timeout = timeout;
        match inner.conn.as_mut() {
            Some(conn) => conn.set_timeout(timeout),
            None => Ok(()),
        }
    }

    pub fn set_max_retries(&self, retries: u32) {
        self.inner.lock().max_retries = retries;
    }

    /// Exposed methods and attributes of the remote object. Connects if needed.
    pub fn metadata(&self) -> Result<ObjectMeta> {
        let mut inner = self.inner.lock();
        inner.check_owner()?;
        inner.ensure_connected()?;
        inner.metadata().cloned()
    }

    /// Adds an annotation to every outgoing request.
    ///
    /// # Errors
    ///
    /// Returns `Pyro` for malformed or reserved keys.
    pub fn set_annotation(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        Annotations::check_user_key(key)?;
        self.inner.lock().annotations.insert(key, value)
    }

    pub fn remove_annotation(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().annotations.remove(key)
    }

    /// Annotations of the last reply.
    pub fn response_annotations(&self) -> Annotations {
        self.inner.lock().response_annotations.clone()
    }

    /// Runs `f` with the retry policy: connection losses and timeouts are
    /// retried up to `max_retries` times.
    fn with_retries<R>(&self, mut f: impl FnMut(&mut ProxyInner) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock();
        inner.check_owner()?;
        let mut attempt = 0;
        loop {
            match f(&mut *inner) {
                Err(e) if e.is_retryable() && attempt < inner.max_retries => {
                    attempt += 1;
                    tracing::debug!(uri = %inner.uri, attempt, error = %e, "Retrying call");
                }
                other => return other,
            }
        }
    }

    fn bind(&self, decoded: Decoded) -> CallOutcome {
        match decoded {
            Decoded::Value(value) => CallOutcome::Value(value),
            Decoded::Stream(id) => {
                let seq = self.inner.lock().seq;
                CallOutcome::Stream(ItemStream::new(Arc::clone(&self.inner), id, seq))
            }
        }
    }

    /// Calls a remote method.
    ///
    /// Oneway methods return `Value::Null` as soon as the request is sent.
    ///
    /// # Errors
    ///
    /// - `Attribute` if the method is not exposed (no request is sent)
    /// - `Remote` if the method raised
    /// - `Protocol` if the reply does not match the request
    /// - the communication errors, after the connection has been closed
    pub fn call(&self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<CallOutcome> {
        let decoded = self.with_retries(|inner| inner.call(method, &args, &kwargs))?;
        Ok(self.bind(decoded))
    }

    /// Calls a method with positional arguments and returns its value.
    pub fn call_value(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(method, args, Map::new())?.into_value()
    }

    /// Calls a method with a pre-serialized argument.
    ///
    /// The blob's bytes are sent untouched as the request payload; the
    /// daemon routes the call through the `BLBI` annotation.
    pub fn call_blob(&self, method: &str, blob: &SerializedBlob) -> Result<CallOutcome> {
        let decoded = self.with_retries(|inner| {
            inner.ensure_connected()?;
            let oneway = inner.check_method(method)?;
            let object = inner.object_id();
            let serializer = inner.serializers.get(blob.serializer_id())?;

            let mut annotations = inner.outgoing_annotations()?;
            let info = serializer.dumps(&json!([blob.info, object, method]))?;
            annotations.insert(Annotations::BLOB_INFO, info)?;
            let mut flags = Flags::KEEP_SERIALIZED;
            if oneway {
                flags |= Flags::ONEWAY;
            }
            let seq = inner.next_seq();
            let msg = Message::new(MessageType::Invoke, blob.data().to_vec(), blob.serializer_id(), flags, seq)
                .with_annotations(annotations);
            match inner.transact(msg, MessageType::Result)? {
                Some(reply) => inner.decode(&reply, blob.serializer_id()),
                None => Ok(Decoded::Value(Value::Null)),
            }
        })?;
        Ok(self.bind(decoded))
    }

    /// Reads an exposed attribute.
    pub fn get_attr(&self, name: &str) -> Result<Value> {
        self.with_retries(|inner| {
            inner.ensure_connected()?;
            inner.check_attribute(name)?;
            let object = inner.object_id();
            match inner.invoke(&object, "__getattr__", &[json!(name)], &Map::new(), Flags::EMPTY)? {
                Some(reply) => inner.decode_value(&reply, inner.serializer.id()),
                None => Ok(Value::Null),
            }
        })
    }

    /// Writes an exposed attribute.
    pub fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        self.with_retries(|inner| {
            inner.ensure_connected()?;
            inner.check_attribute(name)?;
            let object = inner.object_id();
            let args = [json!(name), value.clone()];
            if let Some(reply) = inner.invoke(&object, "__setattr__", &args, &Map::new(), Flags::EMPTY)? {
                inner.decode_value(&reply, inner.serializer.id())?;
            }
            Ok(())
        })
    }

    /// Round trip with a PING message. Does not touch the remote object.
    pub fn ping(&self) -> Result<()> {
        self.with_retries(|inner| {
            inner.ensure_connected()?;
            let seq = inner.next_seq();
            let msg = Message::new(MessageType::Ping, b"ping".to_vec(), inner.serializer.id(), Flags::EMPTY, seq);
            inner.transact(msg, MessageType::Ping).map(|_| ())
        })
    }

    /// Starts collecting calls for one batch request.
    pub fn batch(&self) -> BatchProxy<'_> {
        BatchProxy::new(self)
    }

    /// Sends collected batch calls. Returns an empty list for oneway batches.
    pub(crate) fn call_batch(&self, calls: &[BatchCall], oneway: bool) -> Result<Vec<Value>> {
        self.with_retries(|inner| {
            inner.ensure_connected()?;
            for call in calls {
                inner.check_method(&call.method)?;
            }
            let args: Vec<Value> = calls
                .iter()
                .map(|c| json!([c.method, c.args, c.kwargs]))
                .collect();
            let mut flags = Flags::BATCH;
            if oneway {
                flags |= Flags::ONEWAY;
            }
            let object = inner.object_id();
            let reply = match inner.invoke(&object, BATCH_METHOD, &args, &Map::new(), flags)? {
                Some(reply) => reply,
                None => return Ok(Vec::new()),
            };
            match inner.decode_value(&reply, inner.serializer.id())? {
                Value::Array(results) => Ok(results),
                other => Err(PyroError::Protocol(format!("batch result is not a list: {}", other))),
            }
        })
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Proxy")
            .field("uri", &inner.uri.to_string())
            .field("state", &inner.state)
            .field("seq", &inner.seq)
            .finish()
    }
}
