//! Batched calls.
//!
//! A [`BatchProxy`] records calls instead of sending them and ships them
//! all in one request. The daemon runs them in order and stops at the first
//! one that fails.

use std::vec;

use pyro_common::{PyroError, RemoteException, Result};
use serde_json::{Map, Value};

use crate::proxy::Proxy;

pub(crate) struct BatchCall {
    pub(crate) method: String,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
}

/// Collects calls for one batch request.
///
/// # Example
///
/// ```no_run
/// use pyro_client::Proxy;
/// use serde_json::json;
///
/// let proxy = Proxy::new("PYRO:calculator@localhost:9090".parse().unwrap()).unwrap();
/// let mut batch = proxy.batch();
/// batch.add("multiply", vec![json!(2), json!(3)]);
/// batch.add("divide", vec![json!(1), json!(0)]);
/// for result in batch.execute().unwrap() {
///     println!("{:?}", result);
/// }
/// ```
pub struct BatchProxy<'a> {
    proxy: &'a Proxy,
    calls: Vec<BatchCall>,
}

impl<'a> BatchProxy<'a> {
    pub(crate) fn new(proxy: &'a Proxy) -> Self {
        Self {
            proxy,
            calls: Vec::new(),
        }
    }

    /// Records a call with positional arguments.
    pub fn add(&mut self, method: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.call(method, args, Map::new())
    }

    /// Records a call.
    pub fn call(&mut self, method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> &mut Self {
        self.calls.push(BatchCall {
            method: method.into(),
            args,
            kwargs,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Sends the recorded calls and returns their results.
    ///
    /// # Errors
    ///
    /// Fails as a whole for transport problems or an unexposed method.
    /// Failures of individual calls are reported by the returned results.
    pub fn execute(self) -> Result<BatchResults> {
        if self.calls.is_empty() {
            return Ok(BatchResults::default());
        }
        let results = self.proxy.call_batch(&self.calls, false)?;
        Ok(BatchResults {
            results: results.into_iter(),
            failed: false,
        })
    }

    /// Sends the recorded calls without waiting for any result.
    pub fn execute_oneway(self) -> Result<()> {
        if self.calls.is_empty() {
            return Ok(());
        }
        self.proxy.call_batch(&self.calls, true).map(|_| ())
    }
}

/// Results of a batch, in call order.
///
/// Yields `Ok` for every call that succeeded, then the error of the first
/// failed call, then ends. Calls after a failure were never run.
#[derive(Debug, Default)]
pub struct BatchResults {
    results: vec::IntoIter<Value>,
    failed: bool,
}

impl Iterator for BatchResults {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let value = self.results.next()?;
        match RemoteException::from_value(&value) {
            Some(exc) => {
                self.failed = true;
                Some(Err(PyroError::Remote(exc)))
            }
            None => Some(Ok(value)),
        }
    }
}
