//! Change feeds
//!
//! A [`ChangeFeed`] is the push channel from the remote store: an initial
//! listing framed by [`FeedEvent::Relist`] and [`FeedEvent::Synced`], then
//! ongoing changes. [`drive`] pumps a feed into a cache [`Store`] until
//! cancelled.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use portico_common::WatchedObject;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Store;

/// One change observed on the remote store
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent<K> {
    /// A full listing starts; objects not re-announced before `Synced` are gone
    Relist,
    /// An object was announced during a listing
    Added(K),
    /// An object was created or modified
    Updated(K),
    /// An object was removed; carries its last known state
    Deleted(K),
    /// The listing is complete
    Synced,
}

/// Source of change notifications for one object kind
pub trait ChangeFeed<K>: Send + Sync {
    /// Open the stream of changes
    ///
    /// May be called once; the stream ends when the feed is closed.
    fn watch(&self) -> BoxStream<'static, FeedEvent<K>>;
}

/// In-process feed backed by an unbounded channel
///
/// Used to embed the controller without a cluster and to drive tests.
pub struct ChannelFeed<K> {
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<FeedEvent<K>>>>,
}

/// Sending half of a [`ChannelFeed`]
#[derive(Clone)]
pub struct FeedSender<K> {
    tx: mpsc::UnboundedSender<FeedEvent<K>>,
}

impl<K: Send + 'static> ChannelFeed<K> {
    /// Create a feed and the sender that writes into it
    pub fn new() -> (FeedSender<K>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            FeedSender { tx },
            Self {
                rx: parking_lot::Mutex::new(Some(rx)),
            },
        )
    }
}

impl<K> FeedSender<K> {
    /// Push one event; returns false if the feed was dropped
    pub fn send(&self, event: FeedEvent<K>) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Announce an initial listing: `Relist`, one `Added` per object, `Synced`
    pub fn list(&self, objects: impl IntoIterator<Item = K>) -> bool {
        let mut ok = self.send(FeedEvent::Relist);
        for obj in objects {
            ok &= self.send(FeedEvent::Added(obj));
        }
        ok & self.send(FeedEvent::Synced)
    }
}

impl<K: Send + 'static> ChangeFeed<K> for ChannelFeed<K> {
    fn watch(&self) -> BoxStream<'static, FeedEvent<K>> {
        match self.rx.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => {
                warn!("ChannelFeed watched more than once; returning empty stream");
                futures::stream::empty().boxed()
            }
        }
    }
}

/// Apply every event of `feed` to `store` until `shutdown` fires or the feed ends
pub async fn drive<K: WatchedObject>(
    feed: Arc<dyn ChangeFeed<K>>,
    store: Arc<Store<K>>,
    shutdown: CancellationToken,
) {
    let kind = K::KIND.as_str();
    let mut stream = feed.watch();
    info!(kind, "Change feed started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind, "Change feed cancelled");
                break;
            }
            event = stream.next() => match event {
                Some(event) => store.apply(event),
                None => {
                    warn!(kind, "Change feed ended");
                    break;
                }
            },
        }
    }
}
