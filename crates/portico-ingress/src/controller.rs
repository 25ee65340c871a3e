//! Ingress reconciler
//!
//! Level-triggered: each run reads the cached Service and Ingress for a key,
//! decides whether the Ingress should exist, and creates or deletes it. The
//! run never looks at what triggered it, so repeating it is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Api, Client};
use portico_common::events::{actions, reasons, EventPublisher};
use portico_common::metrics;
use portico_common::{
    DerivedObject, Error, ObjectKind, ResourceKey, WatchedObject, CONTROLLER_NAME,
};
use portico_runtime::{ObjectCache, Reconciler};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::convert::ingress_from_derived;
use crate::template::{IngressTemplate, DEFAULT_ANNOTATION};

// =============================================================================
// Store client
// =============================================================================

/// Writes to the remote store
///
/// Mocked in tests; [`KubeStoreClient`] talks to the API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Create a derived object
    async fn create(&self, obj: &DerivedObject) -> Result<(), Error>;

    /// Delete an object; [`Error::NotFound`] when it does not exist
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`StoreClient`] backed by the Kubernetes API
pub struct KubeStoreClient {
    client: Client,
}

impl KubeStoreClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_api_error(err: kube::Error, kind: ObjectKind, key: &ResourceKey) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind.as_str(), key.as_str()),
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::already_exists(kind.as_str(), key.as_str())
        }
        _ => err.into(),
    }
}

#[async_trait]
impl StoreClient for KubeStoreClient {
    async fn create(&self, obj: &DerivedObject) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), obj.namespace());
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        api.create(&params, &ingress_from_derived(obj))
            .await
            .map_err(|e| map_api_error(e, ObjectKind::Derived, &obj.key()))?;
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), Error> {
        let key = ResourceKey::new(namespace, name);
        let params = DeleteParams::default();
        let result = match kind {
            ObjectKind::Derived => Api::<Ingress>::namespaced(self.client.clone(), namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
            ObjectKind::Source => Api::<Service>::namespaced(self.client.clone(), namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
        };
        result.map_err(|e| map_api_error(e, kind, &key))
    }
}

// =============================================================================
// Decision
// =============================================================================

/// What a reconcile does to the derived object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Create the derived object
    Create,
    /// Delete the derived object
    Delete,
    /// Leave things as they are
    NoOp,
}

impl ReconcileAction {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Create => "create",
            ReconcileAction::Delete => "delete",
            ReconcileAction::NoOp => "noop",
        }
    }
}

/// Map "should it exist" and "does it exist" onto an action
pub fn decide(wants_derived: bool, exists: bool) -> ReconcileAction {
    match (wants_derived, exists) {
        (true, false) => ReconcileAction::Create,
        (false, true) => ReconcileAction::Delete,
        (true, true) | (false, false) => ReconcileAction::NoOp,
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Inputs to the decision besides the cached objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressSettings {
    /// Annotation whose presence requests an Ingress
    pub annotation: String,
    /// Shape of the generated Ingress
    pub template: IngressTemplate,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            annotation: DEFAULT_ANNOTATION.to_string(),
            template: IngressTemplate::default(),
        }
    }
}

/// Keeps one Ingress per annotated Service
pub struct IngressReconciler {
    cache: ObjectCache,
    store: Arc<dyn StoreClient>,
    events: Arc<dyn EventPublisher>,
    settings: IngressSettings,
}

impl IngressReconciler {
    /// Create a reconciler reading from `cache` and writing through `store`
    pub fn new(
        cache: ObjectCache,
        store: Arc<dyn StoreClient>,
        events: Arc<dyn EventPublisher>,
        settings: IngressSettings,
    ) -> Self {
        Self {
            cache,
            store,
            events,
            settings,
        }
    }

    /// Reconcile one Service key and report the action taken
    #[instrument(skip_all, fields(key = %key))]
    pub async fn sync(&self, key: &ResourceKey) -> Result<ReconcileAction, Error> {
        let (namespace, name) = key.split()?;

        let Some(source) = self.cache.source(key) else {
            debug!("Service not in cache, nothing to do");
            return Ok(ReconcileAction::NoOp);
        };

        let wants = source.has_annotation(&self.settings.annotation);
        let exists = self.cache.derived(key).is_some();

        let taken = match decide(wants, exists) {
            ReconcileAction::Create => {
                let derived = self.settings.template.build(&source);
                self.store.create(&derived).await?;
                info!(ingress = %derived.key(), "Created ingress");
                self.events
                    .publish(
                        &source.object_ref(),
                        EventType::Normal,
                        reasons::INGRESS_CREATED,
                        actions::CREATE,
                        Some(format!("Created Ingress {}", derived.key())),
                    )
                    .await;
                ReconcileAction::Create
            }
            ReconcileAction::Delete => {
                match self.store.delete(ObjectKind::Derived, namespace, name).await {
                    Ok(()) => info!("Deleted ingress"),
                    Err(e) if e.is_not_found() => debug!("Ingress already gone"),
                    Err(e) => return Err(e),
                }
                self.events
                    .publish(
                        &source.object_ref(),
                        EventType::Normal,
                        reasons::INGRESS_DELETED,
                        actions::DELETE,
                        Some(format!("Deleted Ingress {}", key)),
                    )
                    .await;
                ReconcileAction::Delete
            }
            ReconcileAction::NoOp => ReconcileAction::NoOp,
        };

        metrics::record_reconcile_action(taken.as_str());
        Ok(taken)
    }
}

#[async_trait]
impl Reconciler for IngressReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), Error> {
        self.sync(key).await.map(|_| ())
    }
}
