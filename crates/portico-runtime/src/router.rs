//! Event router
//!
//! Translates cache notifications into work-queue keys. Source objects are
//! enqueued under their own key; a deleted derived object is enqueued under
//! its owner's key so the owning source gets a chance to regenerate it.

use std::sync::Arc;

use portico_common::{DerivedObject, ObjectKind, ResourceKey, SourceObject, WatchedObject};
use tracing::{debug, trace};

use crate::cache::{Handler, Notification};
use crate::queue::WorkQueue;

/// Feeds the work queue from both stores
pub struct EventRouter {
    queue: Arc<WorkQueue>,
}

impl EventRouter {
    /// Create a router writing into `queue`
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// A source object appeared
    pub fn on_source_added(&self, obj: &SourceObject) {
        self.queue.add(obj.key());
    }

    /// A source object changed; identical snapshots are ignored
    pub fn on_source_updated(&self, old: &SourceObject, new: &SourceObject) {
        if old == new {
            trace!(key = %new.key(), "Source unchanged, skipping");
            return;
        }
        self.queue.add(new.key());
    }

    /// A derived object was removed
    ///
    /// Enqueues `namespace/owner-name` when the object was controlled by a
    /// source; anything else is not ours to repair.
    pub fn on_derived_deleted(&self, obj: &DerivedObject) {
        let Some(owner) = obj.owner() else {
            trace!(key = %obj.key(), "Deleted derived object has no owner, ignoring");
            return;
        };
        if owner.kind != ObjectKind::SOURCE_KIND {
            trace!(
                key = %obj.key(),
                owner_kind = %owner.kind,
                "Deleted derived object owned by another kind, ignoring"
            );
            return;
        }

        let key = ResourceKey::new(obj.namespace(), &owner.name);
        debug!(key = %key, derived = %obj.key(), "Derived object deleted, enqueueing owner");
        self.queue.add(key);
    }
}

impl Handler<SourceObject> for EventRouter {
    fn on_notification(&self, notification: &Notification<SourceObject>) {
        match notification {
            Notification::Added(obj) => self.on_source_added(obj),
            Notification::Updated { old, new } => self.on_source_updated(old, new),
            Notification::Deleted(obj) => {
                trace!(key = %obj.key(), "Source deleted, nothing to do");
            }
        }
    }
}

impl Handler<DerivedObject> for EventRouter {
    fn on_notification(&self, notification: &Notification<DerivedObject>) {
        match notification {
            Notification::Deleted(obj) => self.on_derived_deleted(obj),
            Notification::Added(obj) | Notification::Updated { new: obj, .. } => {
                trace!(key = %obj.key(), "Derived object changed, nothing to do");
            }
        }
    }
}
