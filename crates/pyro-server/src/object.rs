//! Remote object model.
//!
//! Application code exposes objects by implementing [`RemoteObject`]. The
//! daemon never reflects on an object: what can be called is exactly what
//! [`RemoteObject::metadata`] declares, and calls arrive by name through
//! [`RemoteObject::call`].
//!
//! Objects registered as a class ([`ObjectClass`]) are instantiated by the
//! daemon according to their [`InstanceMode`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use pyro_common::{ObjectMeta, RemoteException, SerializedBlob};
use serde_json::{Map, Value};

use crate::daemon::panic_message;

/// Arguments of one remote call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Set when the caller passed a pre-serialized blob
    pub blob: Option<SerializedBlob>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            blob: None,
        }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self::new(args, Map::new())
    }

    /// The positional argument at `index`.
    pub fn arg(&self, index: usize) -> Result<&Value, RemoteException> {
        self.args.get(index).ok_or_else(|| {
            RemoteException::type_error(format!(
                "missing positional argument {} ({} given)",
                index,
                self.args.len()
            ))
        })
    }

    pub fn i64_arg(&self, index: usize) -> Result<i64, RemoteException> {
        self.arg(index)?
            .as_i64()
            .ok_or_else(|| RemoteException::type_error(format!("argument {} must be an integer", index)))
    }

    pub fn f64_arg(&self, index: usize) -> Result<f64, RemoteException> {
        self.arg(index)?
            .as_f64()
            .ok_or_else(|| RemoteException::type_error(format!("argument {} must be a number", index)))
    }

    pub fn str_arg(&self, index: usize) -> Result<&str, RemoteException> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| RemoteException::type_error(format!("argument {} must be a string", index)))
    }
}

/// Result of a remote method.
pub enum Reply {
    /// A plain value, serialized into the response
    Value(Value),
    /// A lazy sequence, served to the caller one item per request
    Stream(Box<dyn Iterator<Item = Value> + Send>),
}

impl Reply {
    pub fn stream<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Reply::Stream(Box::new(items.into_iter()))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An object that can be called remotely.
///
/// # Example
///
/// ```
/// use pyro_common::{ObjectMeta, RemoteException};
/// use pyro_server::{CallArgs, RemoteObject, Reply};
/// use serde_json::json;
///
/// struct Calculator;
///
/// impl RemoteObject for Calculator {
///     fn metadata(&self) -> ObjectMeta {
///         ObjectMeta::new().method("multiply")
///     }
///
///     fn call(&self, method: &str, args: CallArgs) -> Result<Reply, RemoteException> {
///         match method {
///             "multiply" => Ok(json!(args.i64_arg(0)? * args.i64_arg(1)?).into()),
///             _ => Err(RemoteException::attribute_error(method)),
///         }
///     }
/// }
/// ```
pub trait RemoteObject: Send + Sync {
    /// Exposed methods and attributes.
    fn metadata(&self) -> ObjectMeta;

    /// Invokes an exposed method.
    fn call(&self, method: &str, args: CallArgs) -> Result<Reply, RemoteException>;

    /// Reads an exposed attribute.
    fn get_attribute(&self, name: &str) -> Result<Value, RemoteException> {
        Err(RemoteException::attribute_error(format!("no readable attribute '{}'", name)))
    }

    /// Writes an exposed attribute.
    fn set_attribute(&self, name: &str, _value: Value) -> Result<(), RemoteException> {
        Err(RemoteException::attribute_error(format!("no writable attribute '{}'", name)))
    }
}

/// How many instances of a registered class exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceMode {
    /// One instance per daemon, created on first use
    Single,
    /// One instance per client connection, dropped with the connection
    #[default]
    Session,
    /// A fresh instance for every call
    PerCall,
}

type Factory = Arc<dyn Fn() -> Arc<dyn RemoteObject> + Send + Sync>;

/// A class registered with a daemon.
///
/// The metadata is declared on the class so the handshake can answer
/// without creating an instance.
#[derive(Clone)]
pub struct ObjectClass {
    name: String,
    meta: ObjectMeta,
    mode: InstanceMode,
    factory: Factory,
}

impl ObjectClass {
    pub fn new<F>(name: impl Into<String>, meta: ObjectMeta, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RemoteObject> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            meta,
            mode: InstanceMode::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_mode(mut self, mode: InstanceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn mode(&self) -> InstanceMode {
        self.mode
    }

    /// Whether both handles share one factory, i.e. are the same class.
    pub(crate) fn same_factory(&self, other: &ObjectClass) -> bool {
        Arc::ptr_eq(&self.factory, &other.factory)
    }

    /// Builds a new instance. A panicking factory becomes a `PanicError`.
    pub fn instantiate(&self) -> Result<Arc<dyn RemoteObject>, RemoteException> {
        catch_unwind(AssertUnwindSafe(|| (self.factory)())).map_err(|panic| {
            RemoteException::new(
                "PanicError",
                format!("factory of class '{}' panicked: {}", self.name, panic_message(&*panic)),
            )
        })
    }
}

impl fmt::Debug for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectClass")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Nothing;

    impl RemoteObject for Nothing {
        fn metadata(&self) -> ObjectMeta {
            ObjectMeta::new()
        }

        fn call(&self, method: &str, _args: CallArgs) -> Result<Reply, RemoteException> {
            Err(RemoteException::attribute_error(method))
        }
    }

    #[test]
    fn test_call_args_accessors() {
        let args = CallArgs::positional(vec![json!(7), json!("x"), json!(1.5)]);
        assert_eq!(args.i64_arg(0).unwrap(), 7);
        assert_eq!(args.str_arg(1).unwrap(), "x");
        assert_eq!(args.f64_arg(2).unwrap(), 1.5);
        assert_eq!(args.i64_arg(1).unwrap_err().kind, "TypeError");
        assert_eq!(args.arg(5).unwrap_err().kind, "TypeError");
    }

    #[test]
    fn test_default_attribute_access_fails() {
        assert_eq!(Nothing.get_attribute("x").unwrap_err().kind, "AttributeError");
        assert_eq!(Nothing.set_attribute("x", json!(1)).unwrap_err().kind, "AttributeError");
    }

    #[test]
    fn test_class_defaults_to_session_mode() {
        let class = ObjectClass::new("Nothing", ObjectMeta::new(), || Arc::new(Nothing));
        assert_eq!(class.mode(), InstanceMode::Session);
        let class = class.with_mode(InstanceMode::PerCall);
        assert_eq!(class.mode(), InstanceMode::PerCall);
        assert!(!Arc::ptr_eq(&class.instantiate().unwrap(), &class.instantiate().unwrap()));
    }

    #[test]
    fn test_panicking_factory_is_an_exception() {
        let class = ObjectClass::new("Broken", ObjectMeta::new(), || panic!("no database"));
        let exc = class.instantiate().err().unwrap();
        assert_eq!(exc.kind, "PanicError");
        assert!(exc.message.contains("Broken"), "{}", exc.message);
        assert!(exc.message.contains("no database"), "{}", exc.message);
    }

    #[test]
    fn test_reply_stream() {
        match Reply::stream(vec![json!(1), json!(2)]) {
            Reply::Stream(iter) => assert_eq!(iter.count(), 2),
            Reply::Value(_) => panic!("expected a stream"),
        }
    }
}
