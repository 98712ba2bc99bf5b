//! Name resolution for `PYRONAME:` references.
//!
//! The naming service itself lives outside this crate. Proxies only need a
//! way to turn a symbolic name into a direct `PYRO:` reference, which is
//! what [`NameResolver`] provides.

use std::collections::HashMap;

use parking_lot::RwLock;
use pyro_common::{PyroError, PyroUri, Result};

/// Turns a symbolic object name into a direct reference.
pub trait NameResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns `Pyro` if the name is unknown or the lookup fails.
    fn lookup(&self, name: &str) -> Result<PyroUri>;
}

/// Used when no naming service is configured. Every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl NameResolver for NoResolver {
    fn lookup(&self, name: &str) -> Result<PyroUri> {
        Err(PyroError::Pyro(format!(
            "cannot resolve '{}': no name resolver configured",
            name
        )))
    }
}

/// An in-process name table.
///
/// # Example
///
/// ```
/// use pyro_client::{NameResolver, StaticResolver};
/// use pyro_common::PyroUri;
///
/// let resolver = StaticResolver::new();
/// resolver.register("calculator", "PYRO:calc@localhost:9090".parse().unwrap());
/// assert_eq!(resolver.lookup("calculator").unwrap().object(), "calc");
/// ```
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: RwLock<HashMap<String, PyroUri>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to a direct reference, replacing any previous binding.
    pub fn register(&self, name: impl Into<String>, uri: PyroUri) {
        self.names.write().insert(name.into(), uri);
    }

    pub fn remove(&self, name: &str) -> Option<PyroUri> {
        self.names.write().remove(name)
    }
}

impl NameResolver for StaticResolver {
    fn lookup(&self, name: &str) -> Result<PyroUri> {
        self.names
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PyroError::Pyro(format!("unknown name: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_resolver_fails() {
        assert!(matches!(NoResolver.lookup("x"), Err(PyroError::Pyro(_))));
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticResolver::new();
        assert!(resolver.lookup("calc").is_err());
        let uri: PyroUri = "PYRO:calc@localhost:9090".parse().unwrap();
        resolver.register("calc", uri.clone());
        assert_eq!(resolver.lookup("calc").unwrap(), uri);
        assert_eq!(resolver.remove("calc"), Some(uri));
        assert!(resolver.lookup("calc").is_err());
    }
}
