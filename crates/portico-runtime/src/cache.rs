//! Object cache
//!
//! A [`Store`] is the local, eventually consistent mirror of one object kind.
//! Change-feed events are applied to the index first and only then fanned
//! out to subscribers, so a handler that reads the store sees at least the
//! state it was notified about. Handlers run outside any map lock.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use portico_common::metrics;
use portico_common::{DerivedObject, ResourceKey, SourceObject, WatchedObject};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::feed::FeedEvent;

/// Change delivered to subscribers of a [`Store`]
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    /// An object appeared
    Added(Arc<K>),
    /// A known object was replaced
    Updated {
        /// Previous cached state
        old: Arc<K>,
        /// New cached state
        new: Arc<K>,
    },
    /// An object disappeared; carries its last known state
    Deleted(Arc<K>),
}

impl<K> Notification<K> {
    fn label(&self) -> &'static str {
        match self {
            Notification::Added(_) => "added",
            Notification::Updated { .. } => "updated",
            Notification::Deleted(_) => "deleted",
        }
    }
}

/// Receives notifications from a [`Store`]
pub trait Handler<K>: Send + Sync {
    /// Called once per change, after the store has been updated
    fn on_notification(&self, notification: &Notification<K>);
}

/// Local mirror of one object kind
pub struct Store<K> {
    items: DashMap<ResourceKey, Arc<K>>,
    handlers: RwLock<Vec<Arc<dyn Handler<K>>>>,
    // Keys seen since the last Relist; Some while a listing is in progress
    listing: Mutex<Option<HashSet<ResourceKey>>>,
    synced: watch::Sender<bool>,
}

impl<K: WatchedObject> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: WatchedObject> Store<K> {
    /// Create an empty, unsynced store
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            items: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            listing: Mutex::new(None),
            synced,
        }
    }

    /// Look up an object by key
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Register a handler for all subsequent changes
    pub fn subscribe(&self, handler: Arc<dyn Handler<K>>) {
        self.handlers.write().push(handler);
    }

    /// Whether the first full listing has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the first full listing has completed
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply one change-feed event and notify subscribers
    pub fn apply(&self, event: FeedEvent<K>) {
        match event {
            FeedEvent::Relist => {
                debug!(kind = K::KIND.as_str(), "Relist started");
                *self.listing.lock() = Some(HashSet::new());
            }
            FeedEvent::Added(obj) | FeedEvent::Updated(obj) => {
                if let Some(n) = self.upsert(obj) {
                    self.dispatch(&n);
                }
            }
            FeedEvent::Deleted(obj) => {
                let n = self.remove(obj);
                self.dispatch(&n);
            }
            FeedEvent::Synced => self.finish_listing(),
        }
    }

    fn upsert(&self, obj: K) -> Option<Notification<K>> {
        let key = obj.key();
        if let Some(seen) = self.listing.lock().as_mut() {
            seen.insert(key.clone());
        }

        let new = Arc::new(obj);
        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                let old = entry.get().clone();
                if is_stale(old.resource_version(), new.resource_version()) {
                    trace!(
                        kind = K::KIND.as_str(),
                        key = %entry.key(),
                        cached = old.resource_version(),
                        incoming = new.resource_version(),
                        "Dropping stale event"
                    );
                    return None;
                }
                entry.insert(new.clone());
                Some(Notification::Updated { old, new })
            }
            Entry::Vacant(entry) => {
                entry.insert(new.clone());
                Some(Notification::Added(new))
            }
        }
    }

    fn remove(&self, obj: K) -> Notification<K> {
        let key = obj.key();
        if let Some(seen) = self.listing.lock().as_mut() {
            seen.remove(&key);
        }
        match self.items.remove(&key) {
            Some((_, last)) => Notification::Deleted(last),
            None => Notification::Deleted(Arc::new(obj)),
        }
    }

    fn finish_listing(&self) {
        let seen = self.listing.lock().take();
        if let Some(seen) = seen {
            let vanished: Vec<ResourceKey> = self
                .items
                .iter()
                .filter(|entry| !seen.contains(entry.key()))
                .map(|entry| entry.key().clone())
                .collect();

            for key in vanished {
                if let Some((_, last)) = self.items.remove(&key) {
                    debug!(kind = K::KIND.as_str(), key = %key, "Object vanished during relist");
                    self.dispatch(&Notification::Deleted(last));
                }
            }
        }

        if !self.has_synced() {
            debug!(kind = K::KIND.as_str(), count = self.len(), "Cache synced");
        }
        self.synced.send_replace(true);
    }

    fn dispatch(&self, notification: &Notification<K>) {
        metrics::record_cache_event(K::KIND.as_str(), notification.label());
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.on_notification(notification);
        }
    }
}

// Versions of 0 are unknown and never considered stale.
fn is_stale(cached: u64, incoming: u64) -> bool {
    cached != 0 && incoming != 0 && incoming < cached
}

/// The two stores the controller reads from
#[derive(Clone, Default)]
pub struct ObjectCache {
    /// Source objects (Services)
    pub sources: Arc<Store<SourceObject>>,
    /// Derived objects (Ingresses)
    pub derived: Arc<Store<DerivedObject>>,
}

impl ObjectCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a source object
    pub fn source(&self, key: &ResourceKey) -> Option<Arc<SourceObject>> {
        self.sources.get(key)
    }

    /// Look up a derived object
    pub fn derived(&self, key: &ResourceKey) -> Option<Arc<DerivedObject>> {
        self.derived.get(key)
    }

    /// Whether both stores completed their first listing
    pub fn has_synced(&self) -> bool {
        self.sources.has_synced() && self.derived.has_synced()
    }

    /// Wait for both stores to complete their first listing
    pub async fn wait_synced(&self) {
        self.sources.wait_synced().await;
        self.derived.wait_synced().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Notification<SourceObject>>>,
    }

    impl Handler<SourceObject> for Recorder {
        fn on_notification(&self, notification: &Notification<SourceObject>) {
            self.seen.lock().push(notification.clone());
        }
    }

    fn svc(name: &str, rv: u64) -> SourceObject {
        SourceObject {
            name: name.to_string(),
            namespace: "gitlab".to_string(),
            resource_version: rv,
            ..Default::default()
        }
    }

    fn store_with_recorder() -> (Store<SourceObject>, Arc<Recorder>) {
        let store = Store::new();
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        (store, recorder)
    }

    #[test]
    fn first_sighting_is_added_then_updated() {
        let (store, rec) = store_with_recorder();
        store.apply(FeedEvent::Updated(svc("web", 1)));
        store.apply(FeedEvent::Updated(svc("web", 2)));

        let seen = rec.seen.lock();
        assert!(matches!(&seen[0], Notification::Added(o) if o.resource_version == 1));
        assert!(matches!(
            &seen[1],
            Notification::Updated { old, new } if old.resource_version == 1 && new.resource_version == 2
        ));
    }

    #[test]
    fn stale_versions_are_dropped() {
        let (store, rec) = store_with_recorder();
        store.apply(FeedEvent::Updated(svc("web", 5)));
        store.apply(FeedEvent::Updated(svc("web", 3)));

        assert_eq!(store.get(&"gitlab/web".into()).unwrap().resource_version, 5);
        assert_eq!(rec.seen.lock().len(), 1);
    }

    #[test]
    fn equal_versions_are_delivered_as_updates() {
        let (store, rec) = store_with_recorder();
        store.apply(FeedEvent::Updated(svc("web", 5)));
        store.apply(FeedEvent::Updated(svc("web", 5)));
        assert_eq!(rec.seen.lock().len(), 2);
    }

    #[test]
    fn delete_carries_last_known_state() {
        let (store, rec) = store_with_recorder();
        let mut annotated = svc("web", 4);
        annotated.annotations.insert("ingress/http".into(), "".into());
        store.apply(FeedEvent::Added(annotated));
        store.apply(FeedEvent::Deleted(svc("web", 0)));

        assert!(store.is_empty());
        let seen = rec.seen.lock();
        assert!(matches!(&seen[1], Notification::Deleted(o) if o.has_annotation("ingress/http")));
    }

    /// Handlers must observe the post-change state when they read the store
    #[test]
    fn index_is_updated_before_handlers_run() {
        struct Reader {
            store: std::sync::Weak<Store<SourceObject>>,
            observed: Mutex<Option<u64>>,
        }
        impl Handler<SourceObject> for Reader {
            fn on_notification(&self, _: &Notification<SourceObject>) {
                let store = self.store.upgrade().unwrap();
                *self.observed.lock() =
                    store.get(&"gitlab/web".into()).map(|o| o.resource_version);
            }
        }

        let store = Arc::new(Store::new());
        let reader = Arc::new(Reader {
            store: Arc::downgrade(&store),
            observed: Mutex::new(None),
        });
        store.subscribe(reader.clone());
        store.apply(FeedEvent::Added(svc("web", 7)));
        assert_eq!(*reader.observed.lock(), Some(7));
    }

    /// Story: the watch reconnects and an object vanished while we were away
    #[test]
    fn story_relist_removes_objects_that_vanished() {
        let (store, rec) = store_with_recorder();
        store.apply(FeedEvent::Relist);
        store.apply(FeedEvent::Added(svc("web", 1)));
        store.apply(FeedEvent::Added(svc("api", 1)));
        store.apply(FeedEvent::Synced);
        assert!(store.has_synced());
        assert_eq!(store.len(), 2);

        store.apply(FeedEvent::Relist);
        store.apply(FeedEvent::Added(svc("web", 2)));
        store.apply(FeedEvent::Synced);

        let names: Vec<String> = store.list().iter().map(|o| o.name.clone()).collect();
        assert_eq!(names, vec!["web".to_string()]);
        let seen = rec.seen.lock();
        assert!(matches!(seen.last(), Some(Notification::Deleted(o)) if o.name == "api"));
    }

    #[tokio::test]
    async fn wait_synced_returns_after_first_listing() {
        let store = Arc::new(Store::<SourceObject>::new());
        assert!(!store.has_synced());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_synced().await })
        };
        store.apply(FeedEvent::Relist);
        store.apply(FeedEvent::Synced);
        waiter.await.unwrap();
        assert!(store.has_synced());
    }

    #[test]
    fn object_cache_routes_lookups_by_kind() {
        let cache = ObjectCache::new();
        cache.sources.apply(FeedEvent::Added(svc("web", 1)));
        let key = ResourceKey::from("gitlab/web");
        assert!(cache.source(&key).is_some());
        assert!(cache.derived(&key).is_none());
        assert!(!cache.has_synced());
    }
}
