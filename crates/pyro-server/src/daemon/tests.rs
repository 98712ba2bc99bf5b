use super::*;
use crate::object::{CallArgs, InstanceMode, Reply};
use pyro_common::protocol::HEADER_SIZE;
use pyro_common::Serializer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Replays encoded reply bytes as a transport.
struct Replay {
    data: Vec<u8>,
    pos: usize,
}

impl Transport for Replay {
    fn send(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.pos + size > self.data.len() {
            return Err(PyroError::ConnectionClosed("replay exhausted".into()));
        }
        let chunk = self.data[self.pos..self.pos + size].to_vec();
        self.pos += size;
        Ok(chunk)
    }

    fn close(&mut self) {}
}

fn decode(bytes: Vec<u8>) -> Message {
    let len = bytes.len();
    let msg = Message::recv(&mut Replay { data: bytes, pos: 0 }, None, &WireOptions::default()).unwrap();
    assert!(len >= HEADER_SIZE);
    msg
}

fn payload(msg: &Message) -> Value {
    JsonSerializer.loads(&msg.payload).unwrap()
}

struct Calculator {
    precision: Mutex<i64>,
}

impl Calculator {
    fn new() -> Arc<dyn RemoteObject> {
        Arc::new(Calculator { precision: Mutex::new(2) })
    }
}

impl RemoteObject for Calculator {
    fn metadata(&self) -> ObjectMeta {
        ObjectMeta::new()
            .method("multiply")
            .method("divide")
            .method("numbers")
            .method("explode")
            .method("_hidden")
            .oneway_method("fail_later")
            .attribute("precision")
    }

    fn call(&self, method: &str, args: CallArgs) -> std::result::Result<Reply, RemoteException> {
        match method {
            "multiply" => Ok(json!(args.i64_arg(0)? * args.i64_arg(1)?).into()),
            "divide" => {
                let divisor = args.i64_arg(1)?;
                if divisor == 0 {
                    return Err(RemoteException::zero_division());
                }
                Ok(json!(args.i64_arg(0)? / divisor).into())
            }
            "numbers" => {
                let n = args.i64_arg(0)?;
                Ok(Reply::stream((0..n).map(|i| json!(i))))
            }
            "explode" => panic!("kaboom"),
            "fail_later" => Err(RemoteException::value_error("oneway failure")),
            _ => Err(RemoteException::attribute_error(method)),
        }
    }

    fn get_attribute(&self, name: &str) -> std::result::Result<Value, RemoteException> {
        match name {
            "precision" => Ok(json!(*self.precision.lock())),
            _ => Err(RemoteException::attribute_error(name)),
        }
    }

    fn set_attribute(&self, name: &str, value: Value) -> std::result::Result<(), RemoteException> {
        match (name, value.as_i64()) {
            ("precision", Some(p)) => {
                *self.precision.lock() = p;
                Ok(())
            }
            _ => Err(RemoteException::type_error("precision must be an integer")),
        }
    }
}

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

struct Counted {
    id: usize,
}

impl RemoteObject for Counted {
    fn metadata(&self) -> ObjectMeta {
        ObjectMeta::new().method("instance_id")
    }

    fn call(&self, _method: &str, _args: CallArgs) -> std::result::Result<Reply, RemoteException> {
        Ok(json!(self.id).into())
    }
}

fn counted_class(name: &str, mode: InstanceMode) -> ObjectClass {
    ObjectClass::new(name, ObjectMeta::new().method("instance_id"), || {
        Arc::new(Counted { id: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst) }) as Arc<dyn RemoteObject>
    })
    .with_mode(mode)
}

fn invoke_msg(object: &str, method: &str, args: Vec<Value>, flags: Flags, seq: u16) -> Message {
    let payload = JsonSerializer.dumps_call(object, method, &args, &serde_json::Map::new()).unwrap();
    Message::new(MessageType::Invoke, payload, JsonSerializer::ID, flags, seq)
}

fn call(daemon: &Arc<Daemon>, client: &ClientConnection, object: &str, method: &str, args: Vec<Value>) -> Message {
    let reply = daemon
        .process_message(client, invoke_msg(object, method, args, Flags::EMPTY, 1))
        .unwrap()
        .expect("normal calls get a reply");
    decode(reply)
}

fn daemon_with_calculator() -> Arc<Daemon> {
    let daemon = Daemon::new(Config::default());
    daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap();
    daemon
}

#[test]
fn test_builtin_object_is_registered() {
    let daemon = Daemon::new(Config::default());
    assert_eq!(daemon.registered(), vec![DAEMON_NAME.to_string()]);
    assert!(daemon.metadata(DAEMON_NAME).unwrap().is_oneway("close_stream"));
    assert!(matches!(daemon.unregister(DAEMON_NAME), Err(PyroError::Daemon(_))));
}

#[test]
fn test_generated_ids() {
    let daemon = Daemon::new(Config::default());
    let uri = daemon.register(Calculator::new(), RegisterOptions::default()).unwrap();
    let id = uri.object();
    assert!(id.starts_with("obj_"));
    assert_eq!(id.len(), 4 + 32);
    assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_duplicate_registration() {
    let daemon = Daemon::new(Config::default());
    daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap();
    let err = daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap_err();
    assert!(matches!(err, PyroError::Daemon(_)));

    let replacement = Arc::new(Counted { id: 999 }) as Arc<dyn RemoteObject>;
    daemon.register(replacement, RegisterOptions::id("calc").force()).unwrap();
    let client = ClientConnection::new("test");
    assert_eq!(payload(&call(&daemon, &client, "calc", "instance_id", vec![])), json!(999));
}

#[test]
fn test_same_object_twice_needs_force() {
    let daemon = Daemon::new(Config::default());
    let calc = Calculator::new();
    daemon.register(calc.clone(), RegisterOptions::id("a")).unwrap();
    assert!(daemon.register(calc.clone(), RegisterOptions::id("b")).is_err());
    daemon.register(calc.clone(), RegisterOptions::id("b").force()).unwrap();
    assert_eq!(daemon.unregister_object(&calc), 2);
}

#[test]
fn test_unregister() {
    let daemon = daemon_with_calculator();
    assert!(daemon.unregister("calc").unwrap());
    assert!(!daemon.unregister("calc").unwrap());
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "multiply", vec![json!(1), json!(2)]);
    assert!(reply.flags.contains(Flags::EXCEPTION));
    assert_eq!(RemoteException::from_value(&payload(&reply)).unwrap().kind, "DaemonError");
}

#[test]
fn test_weak_registration_disappears() {
    let daemon = Daemon::new(Config::default());
    let calc = Calculator::new();
    daemon.register_weak(&calc, RegisterOptions::id("weak")).unwrap();
    assert!(daemon.registered().contains(&"weak".to_string()));
    drop(calc);
    daemon.housekeeping();
    assert!(!daemon.registered().contains(&"weak".to_string()));
}

#[test]
fn test_handshake_accepts_and_sends_metadata() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let connect = Message::new(
        MessageType::Connect,
        JsonSerializer.dumps(&json!({"handshake": {"user": "x"}, "object": "calc"})).unwrap(),
        JsonSerializer::ID,
        Flags::EMPTY,
        0,
    );
    let (bytes, accepted) = daemon.handshake_response(&client, &connect).unwrap();
    assert!(accepted);
    assert!(bytes.len() >= 64);
    let reply = decode(bytes);
    assert_eq!(reply.msg_type, MessageType::ConnectOk);
    let body = payload(&reply);
    assert_eq!(body["handshake"], json!("hello"));
    let meta: ObjectMeta = serde_json::from_value(body["meta"].clone()).unwrap();
    assert!(meta.has_method("multiply"));
    assert_eq!(client.handshake_data(), Some(json!({"user": "x"})));
}

#[test]
fn test_handshake_rejects_unknown_object() {
    let daemon = Daemon::new(Config::default());
    let client = ClientConnection::new("test");
    let connect = Message::new(
        MessageType::Connect,
        JsonSerializer.dumps(&json!({"handshake": null, "object": "missing"})).unwrap(),
        JsonSerializer::ID,
        Flags::EMPTY,
        0,
    );
    let (bytes, accepted) = daemon.handshake_response(&client, &connect).unwrap();
    assert!(!accepted);
    let reply = decode(bytes);
    assert_eq!(reply.msg_type, MessageType::ConnectFail);
    assert!(payload(&reply).as_str().unwrap().contains("unknown object"));
}

struct Password;

impl HandshakeValidator for Password {
    fn validate(&self, _client: &ClientConnection, data: &Value) -> std::result::Result<Value, String> {
        if data == &json!("secret") {
            Ok(json!("welcome"))
        } else {
            Err("bad password".to_string())
        }
    }
}

#[test]
fn test_custom_handshake_validator() {
    let daemon = daemon_with_calculator();
    daemon.set_handshake_validator(Arc::new(Password));
    let client = ClientConnection::new("test");
    let connect = |secret: &str| {
        Message::new(
            MessageType::Connect,
            JsonSerializer.dumps(&json!({"handshake": secret, "object": "calc"})).unwrap(),
            JsonSerializer::ID,
            Flags::EMPTY,
            0,
        )
    };
    let (_, accepted) = daemon.handshake_response(&client, &connect("secret")).unwrap();
    assert!(accepted);
    let (bytes, accepted) = daemon.handshake_response(&client, &connect("guess")).unwrap();
    assert!(!accepted);
    assert_eq!(payload(&decode(bytes)), json!("bad password"));
}

#[test]
fn test_invoke_returns_result() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "multiply", vec![json!(7), json!(6)]);
    assert_eq!(reply.msg_type, MessageType::Result);
    assert_eq!(reply.seq, 1);
    assert!(!reply.flags.contains(Flags::EXCEPTION));
    assert_eq!(payload(&reply), json!(42));
}

#[test]
fn test_private_and_unexposed_names_rejected() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    for method in ["_hidden", "not_there"] {
        let reply = call(&daemon, &client, "calc", method, vec![]);
        assert!(reply.flags.contains(Flags::EXCEPTION));
        let exc = RemoteException::from_value(&payload(&reply)).unwrap();
        assert_eq!(exc.kind, "AttributeError", "{}", method);
    }
}

#[test]
fn test_exception_carries_server_traceback() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "divide", vec![json!(1), json!(0)]);
    assert!(reply.flags.contains(Flags::EXCEPTION));
    let exc = RemoteException::from_value(&payload(&reply)).unwrap();
    assert_eq!(exc.kind, "ZeroDivisionError");
    let text = exc.remote_traceback();
    assert!(text.contains("method 'divide'"));
    assert!(text.contains("ZeroDivisionError: division by zero"));
}

#[test]
fn test_panic_becomes_exception() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "explode", vec![]);
    let exc = RemoteException::from_value(&payload(&reply)).unwrap();
    assert_eq!(exc.kind, "PanicError");
    assert!(exc.message.contains("kaboom"));
}

#[test]
fn test_attribute_access() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    assert_eq!(payload(&call(&daemon, &client, "calc", "__getattr__", vec![json!("precision")])), json!(2));
    let reply = call(&daemon, &client, "calc", "__setattr__", vec![json!("precision"), json!(5)]);
    assert!(!reply.flags.contains(Flags::EXCEPTION));
    assert_eq!(payload(&call(&daemon, &client, "calc", "__getattr__", vec![json!("precision")])), json!(5));

    let reply = call(&daemon, &client, "calc", "__getattr__", vec![json!("secret")]);
    assert_eq!(RemoteException::from_value(&payload(&reply)).unwrap().kind, "AttributeError");
}

#[test]
fn test_ping_message() {
    let daemon = Daemon::new(Config::default());
    let client = ClientConnection::new("test");
    let ping = Message::new(MessageType::Ping, b"ping".to_vec(), JsonSerializer::ID, Flags::EMPTY, 9);
    let reply = decode(daemon.process_message(&client, ping).unwrap().unwrap());
    assert_eq!(reply.msg_type, MessageType::Ping);
    assert_eq!(reply.seq, 9);
}

#[test]
fn test_instance_modes() {
    let daemon = Daemon::new(Config::default());
    daemon.register_class(counted_class("Single", InstanceMode::Single), RegisterOptions::id("single")).unwrap();
    daemon.register_class(counted_class("Session", InstanceMode::Session), RegisterOptions::id("session")).unwrap();
    daemon.register_class(counted_class("PerCall", InstanceMode::PerCall), RegisterOptions::id("percall")).unwrap();

    let first = ClientConnection::new("first");
    let second = ClientConnection::new("second");
    let id = |client: &ClientConnection, object: &str| payload(&call(&daemon, client, object, "instance_id", vec![]));

    assert_eq!(id(&first, "single"), id(&second, "single"));

    let a = id(&first, "session");
    assert_eq!(a, id(&first, "session"));
    assert_ne!(a, id(&second, "session"));

    assert_ne!(id(&first, "percall"), id(&first, "percall"));

    daemon.client_disconnected(&first);
    assert_eq!(first.session_count(), 0);
}

#[test]
fn test_panicking_factory_becomes_exception_in_every_mode() {
    let daemon = Daemon::new(Config::default());
    for (id, mode) in [
        ("single", InstanceMode::Single),
        ("session", InstanceMode::Session),
        ("percall", InstanceMode::PerCall),
    ] {
        let class = ObjectClass::new("Broken", ObjectMeta::new().method("instance_id"), || {
            panic!("cannot open database")
        })
        .with_mode(mode);
        daemon.register_class(class, RegisterOptions::id(id)).unwrap();
    }

    let client = ClientConnection::new("test");
    for id in ["single", "session", "percall"] {
        let reply = call(&daemon, &client, id, "instance_id", vec![]);
        assert!(reply.flags.contains(Flags::EXCEPTION), "{}", id);
        let exc = RemoteException::from_value(&payload(&reply)).unwrap();
        assert_eq!(exc.kind, "PanicError", "{}", id);
        assert!(exc.message.contains("cannot open database"), "{}", exc.message);
    }
    assert_eq!(client.session_count(), 0);

    // the daemon keeps serving after a failed factory
    daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap();
    assert_eq!(payload(&call(&daemon, &client, "calc", "multiply", vec![json!(2), json!(3)])), json!(6));
}

#[test]
fn test_same_named_classes_get_separate_instances() {
    let daemon = Daemon::new(Config::default());
    daemon.register_class(counted_class("Worker", InstanceMode::Single), RegisterOptions::id("left")).unwrap();
    daemon.register_class(counted_class("Worker", InstanceMode::Single), RegisterOptions::id("right")).unwrap();
    daemon.register_class(counted_class("Pal", InstanceMode::Session), RegisterOptions::id("a")).unwrap();
    daemon.register_class(counted_class("Pal", InstanceMode::Session), RegisterOptions::id("b")).unwrap();

    let client = ClientConnection::new("test");
    let id = |object: &str| payload(&call(&daemon, &client, object, "instance_id", vec![]));
    assert_eq!(id("left"), id("left"));
    assert_ne!(id("left"), id("right"));
    assert_eq!(id("a"), id("a"));
    assert_ne!(id("a"), id("b"));
}

#[test]
fn test_batch_stops_at_first_failure() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let calls = vec![
        json!(["multiply", [2, 3], {}]),
        json!(["multiply", [4, 5], {}]),
        json!(["divide", [1, 0], {}]),
        json!(["multiply", [6, 7], {}]),
    ];
    let reply = decode(
        daemon
            .process_message(&client, invoke_msg("calc", "<batch>", calls, Flags::BATCH, 3))
            .unwrap()
            .unwrap(),
    );
    assert!(!reply.flags.contains(Flags::EXCEPTION));
    let results = payload(&reply);
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], json!(6));
    assert_eq!(results[1], json!(20));
    assert_eq!(RemoteException::from_value(&results[2]).unwrap().kind, "ZeroDivisionError");
}

#[test]
fn test_stream_result_and_exhaustion() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "numbers", vec![json!(2)]);
    assert!(reply.flags.contains(Flags::ITEM_STREAM_RESULT));
    let stream_id = String::from_utf8(reply.annotations.get(Annotations::STREAM_ID).unwrap().to_vec()).unwrap();
    assert_eq!(daemon.stream_count(), 1);

    let next = |client: &ClientConnection| call(&daemon, client, DAEMON_NAME, "get_next_stream_item", vec![json!(stream_id)]);
    assert_eq!(payload(&next(&client)), json!(0));
    assert_eq!(payload(&next(&client)), json!(1));
    let end = next(&client);
    assert!(RemoteException::from_value(&payload(&end)).unwrap().is_stop_iteration());
    assert_eq!(daemon.stream_count(), 0);

    let gone = RemoteException::from_value(&payload(&next(&client))).unwrap();
    assert_eq!(gone.message, "item stream terminated");
}

#[test]
fn test_streaming_disabled() {
    let daemon = Daemon::new(Config::default().with_iter_streaming(false));
    daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap();
    let client = ClientConnection::new("test");
    let reply = call(&daemon, &client, "calc", "numbers", vec![json!(3)]);
    assert!(reply.flags.contains(Flags::EXCEPTION));
    assert_eq!(daemon.stream_count(), 0);
}

#[test]
fn test_disconnect_drops_streams_without_linger() {
    let daemon = Daemon::new(Config::default().with_iter_stream_linger(Duration::ZERO));
    daemon.register(Calculator::new(), RegisterOptions::id("calc")).unwrap();
    let client = ClientConnection::new("test");
    call(&daemon, &client, "calc", "numbers", vec![json!(3)]);
    assert_eq!(daemon.stream_count(), 1);
    daemon.client_disconnected(&client);
    assert_eq!(daemon.stream_count(), 0);
}

#[test]
fn test_disconnect_keeps_lingering_streams() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    call(&daemon, &client, "calc", "numbers", vec![json!(3)]);
    daemon.client_disconnected(&client);
    daemon.housekeeping();
    assert_eq!(daemon.stream_count(), 1);
}

#[test]
fn test_oneway_errors_go_to_handler() {
    let daemon = daemon_with_calculator();
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = Mutex::new(tx);
    daemon.set_oneway_error_handler(Arc::new(move |object: &str, method: &str, exc: &RemoteException| {
        let _ = tx.lock().send((object.to_string(), method.to_string(), exc.kind.clone()));
    }));

    let client = ClientConnection::new("test");
    let reply = daemon
        .process_message(&client, invoke_msg("calc", "fail_later", vec![], Flags::ONEWAY, 4))
        .unwrap();
    assert!(reply.is_none());
    let (object, method, kind) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((object.as_str(), method.as_str(), kind.as_str()), ("calc", "fail_later", "ValueError"));
}

#[test]
fn test_correlation_id_is_echoed() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let correlation = Uuid::new_v4();
    let mut annotations = Annotations::new();
    annotations
        .insert(Annotations::CORRELATION_ID, correlation.as_bytes().to_vec())
        .unwrap();
    let msg = invoke_msg("calc", "multiply", vec![json!(1), json!(1)], Flags::EMPTY, 2).with_annotations(annotations);
    let reply = decode(daemon.process_message(&client, msg).unwrap().unwrap());
    assert_eq!(reply.annotations.get(Annotations::CORRELATION_ID), Some(&correlation.as_bytes()[..]));
}

#[test]
fn test_unknown_serializer_gets_json_exception() {
    let daemon = daemon_with_calculator();
    let client = ClientConnection::new("test");
    let msg = Message::new(MessageType::Invoke, b"???".to_vec(), 77, Flags::EMPTY, 5);
    let reply = decode(daemon.process_message(&client, msg).unwrap().unwrap());
    assert!(reply.flags.contains(Flags::EXCEPTION));
    assert_eq!(reply.serializer_id, JsonSerializer::ID);
    assert_eq!(RemoteException::from_value(&payload(&reply)).unwrap().kind, "SerializeError");
}

#[test]
fn test_close_clears_registry() {
    let daemon = daemon_with_calculator();
    daemon.close();
    assert_eq!(daemon.registered(), vec![DAEMON_NAME.to_string()]);
}
