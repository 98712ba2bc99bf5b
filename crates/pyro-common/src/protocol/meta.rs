use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Exposed surface of a remote object.
///
/// Sent to the proxy in the handshake response and cached there, so method
/// and attribute names can be validated without a round trip.
///
/// # Example
///
/// ```
/// use pyro_common::ObjectMeta;
///
/// let meta = ObjectMeta::new()
///     .method("multiply")
///     .oneway_method("log")
///     .attribute("precision");
///
/// assert!(meta.has_method("log"));
/// assert!(meta.is_oneway("log"));
/// assert!(!meta.has_method("precision"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// All exposed method names, oneway ones included
    #[serde(default)]
    pub methods: BTreeSet<String>,
    /// Methods the proxy invokes without waiting for a reply
    #[serde(default)]
    pub oneway: BTreeSet<String>,
    /// Exposed attribute names
    #[serde(default)]
    pub attrs: BTreeSet<String>,
}

impl ObjectMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.insert(name.into());
        self
    }

    pub fn oneway_method(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.methods.insert(name.clone());
        self.oneway.insert(name);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attrs.insert(name.into());
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn is_oneway(&self, name: &str) -> bool {
        self.oneway.contains(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains(name)
    }
}

/// Private names are never reachable remotely.
pub fn is_private_name(name: &str) -> bool {
    name.starts_with('_')
}
