//! End-to-end tests of the controller pipeline
//!
//! Drives feed → cache → router → queue → workers → reconciler against an
//! in-memory store that echoes its writes back through the Ingress feed, the
//! way the API server's watch would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use portico_common::retry::RetryConfig;
use portico_common::{
    DerivedObject, Error, NoopEventPublisher, ObjectKind, ResourceKey, SourceObject,
    WatchedObject,
};
use portico_ingress::{IngressReconciler, IngressSettings, StoreClient};
use portico_runtime::{
    ChannelFeed, Controller, ControllerConfig, FeedEvent, FeedSender, ObjectCache,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// In-memory store
// =============================================================================

/// Store that records writes and replays them into the Ingress feed
struct MemoryStore {
    objects: Mutex<BTreeMap<ResourceKey, DerivedObject>>,
    feed: FeedSender<DerivedObject>,
    // Every create call, including failed ones
    attempts: AtomicU32,
    created: AtomicU32,
    deletes: AtomicU32,
    // Number of upcoming creates that fail with a transient error
    failing_creates: AtomicU32,
    version: AtomicU32,
}

impl MemoryStore {
    fn new(feed: FeedSender<DerivedObject>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            feed,
            attempts: AtomicU32::new(0),
            created: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
            failing_creates: AtomicU32::new(0),
            version: AtomicU32::new(100),
        })
    }

    fn get(&self, key: &str) -> Option<DerivedObject> {
        self.objects.lock().get(&ResourceKey::from(key)).cloned()
    }

    /// Delete behind the controller's back, as `kubectl delete ingress` would
    fn delete_out_of_band(&self, key: &str) {
        if let Some(obj) = self.objects.lock().remove(&ResourceKey::from(key)) {
            self.feed.send(FeedEvent::Deleted(obj));
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn create(&self, obj: &DerivedObject) -> Result<(), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(Error::store("Ingress", obj.key().as_str(), "injected failure"));
        }

        let mut objects = self.objects.lock();
        if objects.contains_key(&obj.key()) {
            return Err(Error::already_exists("Ingress", obj.key().as_str()));
        }
        let mut stored = obj.clone();
        stored.resource_version = u64::from(self.version.fetch_add(1, Ordering::SeqCst));
        objects.insert(stored.key(), stored.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        self.feed.send(FeedEvent::Updated(stored));
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), Error> {
        assert_eq!(kind, ObjectKind::Derived);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let key = ResourceKey::new(namespace, name);
        match self.objects.lock().remove(&key) {
            Some(obj) => {
                self.feed.send(FeedEvent::Deleted(obj));
                Ok(())
            }
            None => Err(Error::not_found("Ingress", key.as_str())),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    services: FeedSender<SourceObject>,
    store: Arc<MemoryStore>,
    cache: ObjectCache,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(config: ControllerConfig, initial: Vec<SourceObject>) -> Self {
        let (services, service_feed) = ChannelFeed::new();
        let (ingresses, ingress_feed) = ChannelFeed::new();
        let store = MemoryStore::new(ingresses.clone());

        services.list(initial);
        ingresses.list(Vec::<DerivedObject>::new());

        let controller = Controller::new(config);
        let cache = controller.cache().clone();
        let reconciler = Arc::new(IngressReconciler::new(
            cache.clone(),
            store.clone(),
            Arc::new(NoopEventPublisher),
            IngressSettings::default(),
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.run(
            Arc::new(service_feed),
            Arc::new(ingress_feed),
            reconciler,
            shutdown.clone(),
        ));

        Self {
            services,
            store,
            cache,
            shutdown,
            handle,
        }
    }

    /// Wait until the Ingress exists in the store and the controller has observed it
    async fn wait_for_ingress(&self, key: &str) {
        let key = ResourceKey::from(key);
        eventually(|| self.cache.derived(&key).is_some()).await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

fn service(name: &str, rv: u64, annotated: bool) -> SourceObject {
    let mut annotations = BTreeMap::new();
    if annotated {
        annotations.insert("ingress/http".to_string(), "true".to_string());
    }
    SourceObject {
        name: name.to_string(),
        namespace: "gitlab".to_string(),
        uid: Some(format!("uid-{}", name)),
        annotations,
        resource_version: rv,
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// =============================================================================
// Stories
// =============================================================================

/// Story: gitlab/web is annotated and gets an nginx Ingress for example.com
#[tokio::test]
async fn story_annotated_service_gets_an_ingress() {
    let h = Harness::start(ControllerConfig::default(), vec![service("web", 1, true)]);

    eventually(|| h.store.get("gitlab/web").is_some()).await;
    let ingress = h.store.get("gitlab/web").unwrap();
    assert_eq!(ingress.spec.ingress_class.as_deref(), Some("nginx"));
    assert_eq!(ingress.spec.rules[0].host.as_deref(), Some("example.com"));
    assert_eq!(ingress.spec.rules[0].paths[0].backend.service_name, "web");
    assert_eq!(ingress.owner.as_ref().unwrap().name, "web");

    h.stop().await;
}

/// Story: the annotation is removed and the Ingress is deleted
#[tokio::test]
async fn story_removing_the_annotation_deletes_the_ingress() {
    let h = Harness::start(ControllerConfig::default(), vec![service("web", 1, true)]);
    h.wait_for_ingress("gitlab/web").await;

    h.services.send(FeedEvent::Updated(service("web", 2, false)));
    eventually(|| h.store.get("gitlab/web").is_none()).await;
    assert_eq!(h.store.deletes.load(Ordering::SeqCst), 1);

    h.stop().await;
}

/// Story: someone deletes the generated Ingress and it comes back
#[tokio::test]
async fn story_deleted_ingress_is_regenerated() {
    let h = Harness::start(ControllerConfig::default(), vec![service("web", 1, true)]);
    h.wait_for_ingress("gitlab/web").await;

    h.store.delete_out_of_band("gitlab/web");
    eventually(|| h.store.created.load(Ordering::SeqCst) == 2).await;
    eventually(|| h.store.get("gitlab/web").is_some()).await;

    h.stop().await;
}

/// Story: services without the annotation are never touched
#[tokio::test]
async fn story_plain_services_are_ignored() {
    let h = Harness::start(
        ControllerConfig::default(),
        vec![service("web", 1, false), service("api", 1, true)],
    );
    eventually(|| h.store.get("gitlab/api").is_some()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(h.store.get("gitlab/web").is_none());
    assert_eq!(h.store.created.load(Ordering::SeqCst), 1);

    h.stop().await;
}

/// Story: the store keeps failing; the key is tried 1 + max_retry times and then dropped
#[tokio::test]
async fn story_persistent_failures_stop_after_max_retry() {
    let config = ControllerConfig {
        max_retry: 3,
        backoff: RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    };
    let (services, service_feed) = ChannelFeed::new();
    let (ingresses, ingress_feed) = ChannelFeed::new();
    let store = MemoryStore::new(ingresses.clone());
    store.failing_creates.store(u32::MAX, Ordering::SeqCst);
    services.list(vec![service("web", 1, true)]);
    ingresses.list(Vec::<DerivedObject>::new());

    let controller = Controller::new(config);
    let reconciler = Arc::new(IngressReconciler::new(
        controller.cache().clone(),
        store.clone(),
        Arc::new(NoopEventPublisher),
        IngressSettings::default(),
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(
        Arc::new(service_feed),
        Arc::new(ingress_feed),
        reconciler,
        shutdown.clone(),
    ));

    eventually(|| store.attempts.load(Ordering::SeqCst) >= 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    assert!(store.get("gitlab/web").is_none());

    shutdown.cancel();
    handle.await.unwrap();
}

/// Story: a transient failure is retried and eventually succeeds
#[tokio::test]
async fn story_transient_failure_recovers() {
    let config = ControllerConfig {
        backoff: RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    };
    let (services, service_feed) = ChannelFeed::new();
    let (ingresses, ingress_feed) = ChannelFeed::new();
    let store = MemoryStore::new(ingresses.clone());
    store.failing_creates.store(2, Ordering::SeqCst);
    services.list(vec![service("web", 1, true)]);
    ingresses.list(Vec::<DerivedObject>::new());

    let controller = Controller::new(config);
    let reconciler = Arc::new(IngressReconciler::new(
        controller.cache().clone(),
        store.clone(),
        Arc::new(NoopEventPublisher),
        IngressSettings::default(),
    ));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(controller.run(
        Arc::new(service_feed),
        Arc::new(ingress_feed),
        reconciler,
        shutdown.clone(),
    ));

    eventually(|| store.get("gitlab/web").is_some()).await;
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.created.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

/// Story: a burst of identical updates results in a single create
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn story_update_burst_creates_once() {
    let h = Harness::start(ControllerConfig::default(), vec![]);

    for rv in 1..=20 {
        h.services.send(FeedEvent::Updated(service("web", rv, true)));
    }
    eventually(|| h.store.get("gitlab/web").is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.store.created.load(Ordering::SeqCst), 1);
    h.stop().await;
}
