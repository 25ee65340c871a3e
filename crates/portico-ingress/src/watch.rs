//! Kubernetes change feeds
//!
//! Adapts kube-rs `watcher` streams over Services and Ingresses to the
//! runtime's [`FeedEvent`] protocol. The watcher's initial listing maps onto
//! `Relist` / `Added` / `Synced`, so objects deleted while the watch was down
//! are pruned from the cache on reconnect.

use std::fmt::Debug;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use portico_common::{DerivedObject, Error, SourceObject};
use portico_runtime::{ChangeFeed, FeedEvent};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::convert::{derived_from_ingress, source_from_service};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

type Convert<R, K> = fn(&R) -> Result<K, Error>;

/// [`ChangeFeed`] over one Kubernetes resource type
pub struct KubeChangeFeed<R, K> {
    api: Api<R>,
    convert: Convert<R, K>,
}

fn scoped_api<R>(client: Client, namespace: Option<&str>) -> Api<R>
where
    R: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    R::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

impl KubeChangeFeed<Service, SourceObject> {
    /// Watch Services, cluster-wide or in one namespace
    pub fn services(client: Client, namespace: Option<&str>) -> Self {
        Self {
            api: scoped_api(client, namespace),
            convert: source_from_service,
        }
    }
}

impl KubeChangeFeed<Ingress, DerivedObject> {
    /// Watch Ingresses, cluster-wide or in one namespace
    pub fn ingresses(client: Client, namespace: Option<&str>) -> Self {
        Self {
            api: scoped_api(client, namespace),
            convert: derived_from_ingress,
        }
    }
}

impl<R, K> ChangeFeed<K> for KubeChangeFeed<R, K>
where
    R: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K: Send + 'static,
{
    fn watch(&self) -> BoxStream<'static, FeedEvent<K>> {
        let convert = self.convert;
        watcher(
            self.api.clone(),
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff()
        .filter_map(move |event| futures::future::ready(map_event(event, convert)))
        .boxed()
    }
}

/// Translate one watcher event; errors and unconvertible objects are logged and skipped
fn map_event<R, K>(
    event: Result<watcher::Event<R>, watcher::Error>,
    convert: Convert<R, K>,
) -> Option<FeedEvent<K>> {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Watch error, backing off");
            return None;
        }
    };

    let converted = |obj: &R| match convert(obj) {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(error = %e, "Skipping object that cannot be mirrored");
            None
        }
    };

    match event {
        watcher::Event::Init => Some(FeedEvent::Relist),
        watcher::Event::InitApply(obj) => converted(&obj).map(FeedEvent::Added),
        watcher::Event::InitDone => Some(FeedEvent::Synced),
        watcher::Event::Apply(obj) => converted(&obj).map(FeedEvent::Updated),
        watcher::Event::Delete(obj) => converted(&obj).map(FeedEvent::Deleted),
    }
}
