//! Request processing.

use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use pyro_common::context::{current_context, set_current_context, with_current_context, CallContext};
use pyro_common::protocol::{is_private_name, Annotations, Flags, Message, MessageType};
use pyro_common::transport::Transport;
use pyro_common::{
    JsonSerializer, PyroError, RemoteException, Result, SerializedBlob, Serializer,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{panic_message, Daemon, Resolved};
use crate::connection::ClientConnection;
use crate::object::{CallArgs, Reply};

/// A decoded INVOKE.
struct Invocation {
    object: String,
    method: String,
    args: CallArgs,
}

impl Daemon {
    /// Reads one request from the transport and writes the reply, if any.
    ///
    /// Communication errors while reading propagate so the transport server
    /// can drop the connection; everything else is answered as an exception.
    pub fn handle_request<T: Transport + ?Sized>(
        self: &Arc<Self>,
        client: &ClientConnection,
        transport: &mut T,
    ) -> Result<()> {
        let msg = Message::recv(
            transport,
            Some(&[MessageType::Invoke, MessageType::Ping]),
            &self.wire(),
        )?;
        if let Some(reply) = self.process_message(client, msg)? {
            transport.send(&reply)?;
        }
        Ok(())
    }

    /// Processes one received request and returns the encoded reply.
    ///
    /// Returns `None` for oneway requests.
    pub fn process_message(self: &Arc<Self>, client: &ClientConnection, msg: Message) -> Result<Option<Vec<u8>>> {
        self.begin_request(client, &msg);
        match msg.msg_type {
            MessageType::Ping => {
                let pong = Message::new(MessageType::Ping, b"pong".to_vec(), msg.serializer_id, Flags::EMPTY, msg.seq);
                return pong.to_bytes(&self.wire()).map(Some);
            }
            MessageType::Invoke => {}
            other => {
                return Err(PyroError::Protocol(format!("unexpected message type {:?}", other)));
            }
        }

        let oneway = msg.flags.contains(Flags::ONEWAY);
        let serializer = match self.serializers().get(msg.serializer_id) {
            Ok(serializer) => serializer,
            Err(e) => {
                let exc = self.with_server_traceback(e.to_remote_exception(), "?", "?");
                return self.exception_reply(&msg, &JsonSerializer, exc).map(Some);
            }
        };
        let invocation = match decode_invocation(&*serializer, &msg) {
            Ok(invocation) => invocation,
            Err(e) if oneway => {
                tracing::warn!(peer = client.peer(), error = %e, "Discarding undecodable oneway request");
                return Ok(None);
            }
            Err(e) => {
                let exc = self.with_server_traceback(e.to_remote_exception(), "?", "?");
                return self.exception_reply(&msg, &*serializer, exc).map(Some);
            }
        };
        tracing::debug!(
            object = %invocation.object,
            method = %invocation.method,
            seq = msg.seq,
            flags = ?msg.flags,
            "Invoke"
        );

        let batch = msg.flags.contains(Flags::BATCH);
        if oneway {
            self.spawn_oneway(client, invocation, batch);
            return Ok(None);
        }

        let outcome = self
            .resolve(&invocation.object, client)
            .map_err(|e| e.to_remote_exception())
            .and_then(|target| {
                if batch {
                    self.run_batch(&target, client.id(), &invocation)
                } else {
                    self.call_target(&target, client.id(), &invocation.object, &invocation.method, invocation.args.clone())
                }
            })
            .map_err(|exc| self.with_server_traceback(exc, &invocation.object, &invocation.method));
        self.result_reply(client, &msg, &*serializer, outcome).map(Some)
    }

    fn begin_request(&self, client: &ClientConnection, msg: &Message) {
        let correlation_id = msg
            .annotations
            .get(Annotations::CORRELATION_ID)
            .and_then(|bytes| Uuid::from_slice(bytes).ok());
        set_current_context(CallContext {
            seq: msg.seq,
            flags: msg.flags,
            serializer_id: msg.serializer_id,
            annotations: msg.annotations.clone(),
            response_annotations: Annotations::new(),
            correlation_id,
            client: Some(client.handle().clone()),
        });
    }

    /// Runs one method on a resolved target.
    pub(crate) fn call_target(
        &self,
        target: &Resolved,
        client_id: u64,
        object_id: &str,
        method: &str,
        args: CallArgs,
    ) -> std::result::Result<Reply, RemoteException> {
        let (object, meta) = match target {
            Resolved::Builtin => {
                if !super::builtin::metadata().has_method(method) {
                    return Err(no_such_member(object_id, method));
                }
                return guarded(|| self.call_builtin(client_id, method, &args));
            }
            Resolved::Object(object, meta) => (object, meta),
        };
        match method {
            "__getattr__" => {
                let name = args.str_arg(0)?;
                if is_private_name(name) || !meta.has_attr(name) {
                    return Err(no_such_member(object_id, name));
                }
                guarded(|| object.get_attribute(name).map(Reply::Value))
            }
            "__setattr__" => {
                let name = args.str_arg(0)?;
                let value = args.arg(1)?.clone();
                if is_private_name(name) || !meta.has_attr(name) {
                    return Err(no_such_member(object_id, name));
                }
                guarded(|| object.set_attribute(name, value).map(|_| Reply::Value(Value::Null)))
            }
            m if is_private_name(m) => Err(RemoteException::attribute_error(format!(
                "attempt to access a private attribute '{}'",
                m
            ))),
            m if !meta.has_method(m) => Err(no_such_member(object_id, m)),
            m => guarded(|| object.call(m, args)),
        }
    }

    /// Runs the calls of a batch in order, stopping at the first failure.
    ///
    /// The failure is appended to the results as an exception marker.
    fn run_batch(
        &self,
        target: &Resolved,
        client_id: u64,
        invocation: &Invocation,
    ) -> std::result::Result<Reply, RemoteException> {
        let mut results = Vec::with_capacity(invocation.args.args.len());
        for (index, entry) in invocation.args.args.iter().enumerate() {
            let outcome = parse_batch_entry(entry).and_then(|(method, args)| {
                let result = self.call_target(target, client_id, &invocation.object, &method, args);
                match result {
                    Ok(Reply::Value(value)) => Ok(value),
                    Ok(Reply::Stream(_)) => Err(RemoteException::pyro_error(
                        "item streams cannot be returned from batch calls",
                    )),
                    Err(exc) => Err(self.with_server_traceback(exc, &invocation.object, &method)),
                }
            });
            match outcome {
                Ok(value) => results.push(value),
                Err(exc) => {
                    tracing::debug!(object = %invocation.object, index, "Batch stopped at failing call");
                    results.push(exc.to_value());
                    break;
                }
            }
        }
        Ok(Reply::Value(Value::Array(results)))
    }

    /// Runs a oneway request on a helper thread.
    ///
    /// The target is resolved before the thread starts so session instances
    /// still see the live connection. The helper gets a copy of the context.
    fn spawn_oneway(self: &Arc<Self>, client: &ClientConnection, invocation: Invocation, batch: bool) {
        let target = match self.resolve(&invocation.object, client) {
            Ok(target) => target,
            Err(e) => {
                self.report_oneway_error(&invocation.object, &invocation.method, &e.to_remote_exception());
                return;
            }
        };
        let context = current_context();
        let daemon = Arc::clone(self);
        let client_id = client.id();
        let name = format!("Pyro-oneway-{}", invocation.method);

        let spawned = thread::Builder::new().name(name).spawn(move || {
            set_current_context(context);
            if batch {
                if let Ok(Reply::Value(Value::Array(results))) = daemon.run_batch(&target, client_id, &invocation) {
                    if let Some(exc) = results.iter().find_map(RemoteException::from_value) {
                        daemon.report_oneway_error(&invocation.object, &invocation.method, &exc);
                    }
                }
                return;
            }
            let result = daemon.call_target(
                &target,
                client_id,
                &invocation.object,
                &invocation.method,
                invocation.args.clone(),
            );
            if let Err(exc) = result {
                let exc = daemon.with_server_traceback(exc, &invocation.object, &invocation.method);
                daemon.report_oneway_error(&invocation.object, &invocation.method, &exc);
            }
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start oneway helper thread");
        }
    }

    /// Encodes the outcome of a normal call.
    fn result_reply(
        &self,
        client: &ClientConnection,
        msg: &Message,
        serializer: &dyn Serializer,
        outcome: std::result::Result<Reply, RemoteException>,
    ) -> Result<Vec<u8>> {
        let mut annotations = self.reply_annotations(msg)?;
        let (payload, flags) = match outcome {
            Err(exc) => return self.exception_reply(msg, serializer, exc),
            Ok(Reply::Value(value)) => match serializer.dumps(&value) {
                Ok(payload) => (payload, Flags::EMPTY),
                Err(e) => {
                    let exc = RemoteException::new("SerializeError", format!("result could not be serialized: {}", e));
                    return self.exception_reply(msg, serializer, exc);
                }
            },
            Ok(Reply::Stream(items)) => {
                if !self.config().iter_streaming {
                    let exc = RemoteException::pyro_error("result of call is an iterator but item streaming is disabled");
                    return self.exception_reply(msg, serializer, exc);
                }
                let stream_id = self.streams().create(client.id(), items);
                annotations.insert(Annotations::STREAM_ID, stream_id.as_bytes().to_vec())?;
                (serializer.dumps(&json!(stream_id))?, Flags::ITEM_STREAM_RESULT)
            }
        };

        let reply = Message::new(MessageType::Result, payload, serializer.id(), flags, msg.seq)
            .with_annotations(annotations);
        match reply.to_bytes(&self.wire()) {
            Ok(bytes) => Ok(bytes),
            Err(e @ PyroError::MessageTooLarge { .. }) => self.exception_reply(msg, serializer, e.to_remote_exception()),
            Err(e) => Err(e),
        }
    }

    /// Encodes an exception reply.
    ///
    /// If the exception cannot be serialized with the request's serializer a
    /// plain `PyroError` is sent with the JSON serializer instead, so the
    /// client always receives something it can decode.
    fn exception_reply(&self, msg: &Message, serializer: &dyn Serializer, exc: RemoteException) -> Result<Vec<u8>> {
        let annotations = self.reply_annotations(msg)?;
        let (payload, serializer_id) = match serializer.dumps(&exc.to_value()) {
            Ok(payload) => (payload, serializer.id()),
            Err(e) => {
                tracing::warn!(error = %e, "Exception could not be serialized, sending a PyroError instead");
                let fallback = RemoteException::pyro_error(format!(
                    "error serializing exception: {}; original exception: {}",
                    e, exc
                ));
                (JsonSerializer.dumps(&fallback.to_value())?, JsonSerializer::ID)
            }
        };
        Message::new(MessageType::Result, payload, serializer_id, Flags::EXCEPTION, msg.seq)
            .with_annotations(annotations)
            .to_bytes(&self.wire())
    }

    /// Response annotations set by the method plus the echoed correlation id.
    fn reply_annotations(&self, msg: &Message) -> Result<Annotations> {
        let mut annotations = with_current_context(|ctx| ctx.response_annotations.clone());
        if let Some(correlation) = msg.annotations.get(Annotations::CORRELATION_ID) {
            annotations.insert(Annotations::CORRELATION_ID, correlation.to_vec())?;
        }
        Ok(annotations)
    }

    /// Prepends the server-side call site to an exception's traceback.
    pub(crate) fn with_server_traceback(&self, mut exc: RemoteException, object_id: &str, method: &str) -> RemoteException {
        if exc.is_stop_iteration() {
            return exc;
        }
        let mut traceback = vec![
            "Traceback (most recent call last):".to_string(),
            format!("  daemon {}, object '{}', method '{}'", self.location(), object_id, method),
        ];
        traceback.extend(exc.traceback.drain(..).map(|line| format!("  {}", line.trim_end())));
        if self.config().detailed_traceback {
            let backtrace = Backtrace::force_capture().to_string();
            traceback.extend(backtrace.lines().map(|line| format!("    {}", line)));
        }
        traceback.push(exc.to_string());
        exc.traceback = traceback;
        exc
    }
}

fn decode_invocation(serializer: &dyn Serializer, msg: &Message) -> Result<Invocation> {
    if msg.flags.contains(Flags::KEEP_SERIALIZED) {
        let info = msg.annotations.get(Annotations::BLOB_INFO).ok_or_else(|| {
            PyroError::Protocol("kept-serialized request without blob info annotation".to_string())
        })?;
        let info = serializer.loads(info)?;
        let parts = info.as_array().filter(|parts| parts.len() == 3);
        let (blob_info, object, method) = match parts {
            Some(parts) => match (parts[1].as_str(), parts[2].as_str()) {
                (Some(object), Some(method)) => (parts[0].clone(), object.to_string(), method.to_string()),
                _ => return Err(PyroError::Serialize("malformed blob info".to_string())),
            },
            None => return Err(PyroError::Serialize("malformed blob info".to_string())),
        };
        let blob = SerializedBlob::from_raw(blob_info, msg.payload.clone(), msg.serializer_id);
        return Ok(Invocation {
            object,
            method,
            args: CallArgs {
                args: Vec::new(),
                kwargs: Map::new(),
                blob: Some(blob),
            },
        });
    }
    let call = serializer.loads_call(&msg.payload)?;
    Ok(Invocation {
        object: call.object,
        method: call.method,
        args: CallArgs::new(call.args, call.kwargs),
    })
}

/// Splits a batch entry `[method, [args..], {kwargs..}]`.
fn parse_batch_entry(entry: &Value) -> std::result::Result<(String, CallArgs), RemoteException> {
    let malformed = || RemoteException::type_error("malformed batch entry");
    let parts = entry.as_array().ok_or_else(malformed)?;
    let method = parts.first().and_then(Value::as_str).ok_or_else(malformed)?;
    let args = match parts.get(1) {
        Some(Value::Array(args)) => args.clone(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(malformed()),
    };
    let kwargs = match parts.get(2) {
        Some(Value::Object(kwargs)) => kwargs.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(malformed()),
    };
    Ok((method.to_string(), CallArgs::new(args, kwargs)))
}

fn no_such_member(object_id: &str, name: &str) -> RemoteException {
    RemoteException::attribute_error(format!(
        "remote object '{}' has no exposed attribute or method '{}'",
        object_id, name
    ))
}

/// Runs user code, turning a panic into an exception.
fn guarded<T>(f: impl FnOnce() -> std::result::Result<T, RemoteException>) -> std::result::Result<T, RemoteException> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(RemoteException::new(
            "PanicError",
            format!("remote method panicked: {}", panic_message(&*panic)),
        )),
    }
}
