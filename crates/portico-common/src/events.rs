//! Kubernetes Event recording.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the reconcile
//! engine can report what it did on the source object (`kubectl describe
//! service`) and tests can swap in a no-op.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! returned. A failed event must never fail a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// `reason` is machine-readable (see [`reasons`]), `action` names what was
    /// done (see [`actions`]) and `note` is an optional human-readable message.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the cluster's events API.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                object = ?resource_ref.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops everything; used when running without a cluster.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`).
pub mod reasons {
    /// The derived Ingress was created for an annotated Service
    pub const INGRESS_CREATED: &str = "IngressCreated";
    /// The derived Ingress was removed after the annotation went away
    pub const INGRESS_DELETED: &str = "IngressDeleted";
}

/// Event actions (ACTION column of `kubectl get events`).
pub mod actions {
    /// Creating the derived object
    pub const CREATE: &str = "Create";
    /// Deleting the derived object
    pub const DELETE: &str = "Delete";
}
