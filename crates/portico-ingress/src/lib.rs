//! Service to Ingress reconciliation
//!
//! A Service carrying the trigger annotation (default `ingress/http`) gets an
//! Ingress with the same name, controlled by the Service. Removing the
//! annotation removes the Ingress; deleting the Ingress by hand brings it
//! back.

#![deny(missing_docs)]

pub mod controller;
pub mod convert;
pub mod template;
pub mod watch;

pub use controller::{
    decide, IngressReconciler, IngressSettings, KubeStoreClient, ReconcileAction, StoreClient,
};
pub use template::{IngressTemplate, DEFAULT_ANNOTATION};
pub use watch::KubeChangeFeed;
