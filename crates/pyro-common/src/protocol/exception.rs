//! Remote exceptions.
//!
//! An exception raised inside a remote method travels back to the caller as
//! data. On the wire it is an ordinary serialized value: a mapping carrying
//! the [`EXCEPTION_MARKER`] key plus the exception kind, message and the
//! server-side traceback lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Key that marks a serialized value as an exception.
pub const EXCEPTION_MARKER: &str = "__exception__";

/// Exception kind used when iteration over a remote stream is finished.
pub const STOP_ITERATION: &str = "StopIteration";

/// An exception raised by remote code.
///
/// # Example
///
/// ```
/// use pyro_common::RemoteException;
///
/// let exc = RemoteException::new("ZeroDivisionError", "division by zero");
/// let value = exc.to_value();
/// let decoded = RemoteException::from_value(&value).unwrap();
/// assert_eq!(decoded.kind, "ZeroDivisionError");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteException {
    /// Exception type name (e.g. `ValueError`, `AttributeError`)
    pub kind: String,
    /// Human readable message
    pub message: String,
    /// Traceback lines captured on the server side
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn zero_division() -> Self {
        Self::new("ZeroDivisionError", "division by zero")
    }

    pub fn pyro_error(message: impl Into<String>) -> Self {
        Self::new("PyroError", message)
    }

    pub fn stop_iteration() -> Self {
        Self::new(STOP_ITERATION, "")
    }

    pub fn is_stop_iteration(&self) -> bool {
        self.kind == STOP_ITERATION
    }

    /// Attaches traceback lines, replacing any previous ones.
    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    /// The remote traceback as one block of text.
    pub fn remote_traceback(&self) -> String {
        let mut text = String::new();
        for line in &self.traceback {
            text.push_str(line);
            if !line.ends_with('\n') {
                text.push('\n');
            }
        }
        text
    }

    /// Encodes the exception as a marked value.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            EXCEPTION_MARKER: true,
            "kind": self.kind,
            "message": self.message,
            "traceback": self.traceback,
        })
    }

    /// Decodes a marked value. Returns `None` for anything else.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.get(EXCEPTION_MARKER) != Some(&Value::Bool(true)) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for RemoteException {}
