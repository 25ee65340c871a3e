//! Resource keys
//!
//! A [`ResourceKey`] addresses one object of one kind: `namespace/name` for
//! namespaced objects, bare `name` for cluster-scoped ones. Keys are what the
//! work queue stores and what the cache is indexed by.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Opaque `namespace/name` identity of a watched object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Build a key from a namespace and a name
    ///
    /// An empty namespace yields a cluster-scoped key (just the name).
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", namespace, name))
        }
    }

    /// Split the key into `(namespace, name)`
    ///
    /// Returns [`Error::MalformedKey`] when the key has more than one `/`
    /// or an empty name.
    pub fn split(&self) -> Result<(&str, &str), Error> {
        let mut parts = self.0.split('/');
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ("", name),
            (Some(namespace), Some(name), None) => (namespace, name),
            _ => {
                return Err(Error::malformed_key(
                    &self.0,
                    "expected at most one '/' separator",
                ))
            }
        };

        if name.is_empty() {
            return Err(Error::malformed_key(&self.0, "name must not be empty"));
        }

        Ok((namespace, name))
    }

    /// Borrow the raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResourceKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for ResourceKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
