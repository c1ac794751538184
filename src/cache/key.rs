//! Cache key derivation
//!
//! A data consumer's key is a pure function of the resource it loads and the
//! identifiers it depends on. Keys keep the resource name as a readable prefix
//! so a whole resource can be invalidated after a mutation.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Identifiers a data consumer depends on (e.g. the selected school).
///
/// Parameters are kept sorted so insertion order never changes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInputs {
    scope: Option<String>,
    params: BTreeMap<String, String>,
}

impl KeyInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inputs scoped to a tenant such as a school id
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            params: BTreeMap::new(),
        }
    }

    /// Add or replace a parameter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Derive the cache key for `resource` from these inputs
    pub fn cache_key(&self, resource: &str) -> String {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        cache_key(resource, self.scope(), &params)
    }
}

/// Generate a deterministic cache key: `<resource>:<sha256 hex>`.
///
/// The digest covers the resource, scope and sorted parameters.
pub fn cache_key(resource: &str, scope: Option<&str>, params: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();

    hasher.update(resource.as_bytes());
    hasher.update(b"|");
    if let Some(scope) = scope {
        hasher.update(scope.as_bytes());
    }
    hasher.update(b"|");

    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort();
    for (k, v) in sorted {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    format!("{}:{:x}", resource, hasher.finalize())
}

/// Prefix shared by every key of a resource
pub fn resource_prefix(resource: &str) -> String {
    format!("{}:", resource)
}
