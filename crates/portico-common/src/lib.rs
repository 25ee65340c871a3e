//! Common types for Portico: resource keys, the watched object model, errors,
//! retry policy and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod key;
pub mod metrics;
pub mod object;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use key::ResourceKey;
pub use object::{
    BackendPort, DerivedObject, DerivedSpec, IngressBackend, IngressPath, IngressRule, ObjectKind,
    OwnerReference, PathType, SourceObject, WatchedObject,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / reporting component name used against the API server
pub const CONTROLLER_NAME: &str = "portico-ingress-controller";

/// Label key marking resources managed by Portico
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by Portico
pub const LABEL_MANAGED_BY_PORTICO: &str = "portico";
