//! Server Integration Tests
//!
//! Exercises both transport servers through real client proxies:
//! - instance modes of registered classes
//! - thread pool exhaustion as seen by a client
//! - item streams lingering across a reconnect
//! - oneway error reporting
//! - oversized messages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use pyro_client::Proxy;
use pyro_common::{Config, Location, ObjectMeta, PyroError, PyroUri, RemoteException, ServerType};
use pyro_server::{
    CallArgs, Daemon, InstanceMode, ObjectClass, RegisterOptions, RemoteObject, Reply, Server, ShutdownHandle,
};
use serde_json::{json, Map, Value};

/// Knows which instance it is.
struct Numbered(usize);

impl RemoteObject for Numbered {
    fn metadata(&self) -> ObjectMeta {
        Numbered::meta()
    }

    fn call(&self, method: &str, args: CallArgs) -> Result<Reply, RemoteException> {
        match method {
            "whoami" => Ok(json!(self.0).into()),
            "count" => Ok(Reply::stream((0..args.i64_arg(0)?).map(|i| json!(i)))),
            "fail" => Err(RemoteException::value_error("oneway failure")),
            "echo" => Ok(args.arg(0)?.clone().into()),
            _ => Err(RemoteException::attribute_error(method)),
        }
    }
}

impl Numbered {
    fn meta() -> ObjectMeta {
        ObjectMeta::new()
            .method("whoami")
            .method("count")
            .method("echo")
            .oneway_method("fail")
    }

    fn class(counter: &'static AtomicUsize, mode: InstanceMode) -> ObjectClass {
        ObjectClass::new("Numbered", Numbered::meta(), move || {
            Arc::new(Numbered(counter.fetch_add(1, Ordering::SeqCst))) as Arc<dyn RemoteObject>
        })
        .with_mode(mode)
    }
}

fn localhost() -> Location {
    Location::Tcp {
        host: "127.0.0.1".into(),
        port: 0,
    }
}

fn start(daemon: &Arc<Daemon>) -> (ShutdownHandle, thread::JoinHandle<()>) {
    let server = Server::bind(Arc::clone(daemon), &localhost()).unwrap();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || server.serve().unwrap());
    (shutdown, handle)
}

fn whoami(proxy: &Proxy) -> Value {
    proxy.call_value("whoami", vec![]).unwrap()
}

fn instance_mode_uri(daemon: &Arc<Daemon>, counter: &'static AtomicUsize, mode: InstanceMode) -> PyroUri {
    daemon
        .register_class(Numbered::class(counter, mode), RegisterOptions::id("numbered"))
        .unwrap()
}

#[test]
fn test_single_instance_shared_by_clients() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default());
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Single);

    let a = Proxy::new(uri.clone()).unwrap();
    let b = Proxy::new(uri).unwrap();
    assert_eq!(whoami(&a), whoami(&b));
    assert_eq!(COUNTER.load(Ordering::SeqCst), 1);

    drop((a, b));
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_session_instance_per_connection() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default().with_server_type(ServerType::Multiplex));
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Session);

    let a = Proxy::new(uri.clone()).unwrap();
    let b = Proxy::new(uri).unwrap();
    let first = whoami(&a);
    assert_eq!(whoami(&a), first);
    assert_ne!(whoami(&b), first);

    // A new connection is a new session.
    a.release();
    assert_ne!(whoami(&a), first);

    drop((a, b));
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_percall_instance_per_call() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default());
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::PerCall);

    let proxy = Proxy::new(uri).unwrap();
    assert_ne!(whoami(&proxy), whoami(&proxy));

    drop(proxy);
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_exhausted_pool_rejects_proxy() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default().with_threadpool(0, 1));
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Single);

    let busy = Proxy::new(uri.clone()).unwrap();
    busy.connect().unwrap();
    let refused = Proxy::new(uri).unwrap();
    let err = refused.connect().unwrap_err();
    assert!(matches!(err, PyroError::Communication(ref m) if m.contains("no free workers")), "{:?}", err);

    drop(busy);
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_stream_survives_reconnect_while_lingering() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default().with_iter_stream_linger(Duration::from_secs(30)));
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Single);

    let proxy = Proxy::new(uri).unwrap();
    let mut stream = proxy.call("count", vec![json!(3)], Map::new()).unwrap().into_stream().unwrap();
    assert_eq!(stream.next().unwrap().unwrap(), json!(0));

    proxy.release();
    let rest: Vec<Value> = stream.by_ref().map(|item| item.unwrap()).collect();
    assert_eq!(rest, vec![json!(1), json!(2)]);
    assert_eq!(daemon.stream_count(), 0);

    drop(stream);
    drop(proxy);
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_oneway_errors_reach_handler() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let daemon = Daemon::new(Config::default());
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    daemon.set_oneway_error_handler(Arc::new(move |object: &str, method: &str, exc: &RemoteException| {
        let _ = tx.lock().send((object.to_string(), method.to_string(), exc.kind.clone()));
    }));
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Single);

    let proxy = Proxy::new(uri).unwrap();
    assert_eq!(proxy.call_value("fail", vec![]).unwrap(), Value::Null);
    let (object, method, kind) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((object.as_str(), method.as_str(), kind.as_str()), ("numbered", "fail", "ValueError"));

    drop(proxy);
    shutdown.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_oversized_request_is_refused_locally() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let config = Config::default().with_max_message_size(1024).with_compression(false);
    let daemon = Daemon::new(config.clone());
    let (shutdown, handle) = start(&daemon);
    let uri = instance_mode_uri(&daemon, &COUNTER, InstanceMode::Single);

    let proxy = Proxy::with_config(uri, config).unwrap();
    assert_eq!(proxy.call_value("echo", vec![json!("small")]).unwrap(), json!("small"));
    let err = proxy.call_value("echo", vec![json!("x".repeat(4096))]).unwrap_err();
    assert!(matches!(err, PyroError::MessageTooLarge { max: 1024, .. }), "{:?}", err);

    drop(proxy);
    shutdown.shutdown();
    handle.join().unwrap();
}
