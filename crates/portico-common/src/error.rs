//! Error types for Portico
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the object kind and key it concerns where one is known,
//! and [`Error::is_retryable`] tells the worker pool whether a failed
//! reconcile should go back on the queue. Anything the store reports is
//! retried within the worker's `max_retry` bound; only errors that no retry
//! can fix are dropped at once.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Portico operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object does not exist in the store
    #[error("{kind} {key} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "Ingress")
        kind: String,
        /// Key of the missing object
        key: String,
    },

    /// The object already exists in the store
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Kind of the conflicting object
        kind: String,
        /// Key of the conflicting object
        key: String,
    },

    /// A create/delete call against the store failed
    #[error("store error for {kind} {key}: {message}")]
    Store {
        /// Kind of the object being written
        kind: String,
        /// Key of the object being written
        key: String,
        /// Description of what failed
        message: String,
    },

    /// A queue key could not be split into namespace and name
    #[error("malformed resource key '{key}': {message}")]
    MalformedKey {
        /// The offending key
        key: String,
        /// Why the key was rejected
        message: String,
    },

    /// An API object could not be mapped onto the typed object model
    #[error("conversion error for {kind}: {message}")]
    Conversion {
        /// The kind being converted
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "worker", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and key
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an already-exists error for the given kind and key
    pub fn already_exists(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a store error
    pub fn store(kind: impl Into<String>, key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-key error
    pub fn malformed_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a conversion error for the given kind
    pub fn conversion(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conversion {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed keys and conversion failures need a code or data fix and are
    /// never retried. Every store and API error is, including 4xx responses:
    /// a 403 while RBAC propagates or a missing namespace can clear up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MalformedKey { .. } | Error::Conversion { .. } => false,
            Error::Kube { .. }
            | Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::Store { .. }
            | Error::Internal { .. } => true,
        }
    }

    /// Whether this error signals that the object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Short label used for metrics and log fields
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Store { .. } => "store",
            Error::MalformedKey { .. } => "malformed_key",
            Error::Conversion { .. } => "conversion",
            Error::Internal { .. } => "internal",
        }
    }
}
