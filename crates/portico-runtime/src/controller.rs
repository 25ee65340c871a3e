//! Controller assembly
//!
//! Wires the object cache, event router, work queue and worker pool into one
//! unit and runs it against a pair of change feeds.

use std::sync::Arc;
use std::time::Duration;

use portico_common::retry::RetryConfig;
use portico_common::{DerivedObject, SourceObject, WatchedObject};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::ObjectCache;
use crate::feed::{self, ChangeFeed};
use crate::queue::{ItemExponentialBackoff, WorkQueue};
use crate::router::EventRouter;
use crate::worker::{Reconciler, WorkerPool};

/// Tunables of a [`Controller`]
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used for the work queue in logs and metrics
    pub name: String,
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Retries per key before it is dropped
    pub max_retry: u32,
    /// Per-key requeue backoff
    pub backoff: RetryConfig,
    /// Re-enqueue every cached source this often; disabled when `None`
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "ingress-manager".to_string(),
            worker_count: 5,
            max_retry: 10,
            backoff: RetryConfig::per_item(),
            resync_period: None,
        }
    }
}

/// Cache, queue and router for one source/derived pair
pub struct Controller {
    config: ControllerConfig,
    cache: ObjectCache,
    queue: Arc<WorkQueue>,
}

impl Controller {
    /// Build the cache and queue and subscribe the router to both stores
    pub fn new(config: ControllerConfig) -> Self {
        let limiter = Arc::new(ItemExponentialBackoff::new(config.backoff.clone()));
        let queue = Arc::new(WorkQueue::with_rate_limiter(config.name.clone(), limiter));
        let cache = ObjectCache::new();

        let router = Arc::new(EventRouter::new(queue.clone()));
        cache.sources.subscribe(router.clone());
        cache.derived.subscribe(router);

        Self {
            config,
            cache,
            queue,
        }
    }

    /// The cache reconcilers read from
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// The shared work queue
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `shutdown` fires
    ///
    /// Starts both feeds, waits for the first full listing of each, then
    /// runs the worker pool. Returns after the workers drained the queue.
    pub async fn run(
        self,
        sources: Arc<dyn ChangeFeed<SourceObject>>,
        derived: Arc<dyn ChangeFeed<DerivedObject>>,
        reconciler: Arc<dyn Reconciler>,
        shutdown: CancellationToken,
    ) {
        let feeds = [
            tokio::spawn(feed::drive(
                sources,
                self.cache.sources.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(feed::drive(
                derived,
                self.cache.derived.clone(),
                shutdown.clone(),
            )),
        ];

        info!(controller = %self.config.name, "Waiting for caches to sync");
        tokio::select! {
            _ = self.cache.wait_synced() => {
                info!(
                    controller = %self.config.name,
                    sources = self.cache.sources.len(),
                    derived = self.cache.derived.len(),
                    "Caches synced"
                );
            }
            _ = shutdown.cancelled() => {
                info!(controller = %self.config.name, "Shutdown before caches synced");
                self.queue.shut_down();
                return;
            }
        }

        let resync = self.config.resync_period.map(|period| {
            tokio::spawn(resync_loop(
                self.cache.clone(),
                self.queue.clone(),
                period,
                shutdown.clone(),
            ))
        });

        let pool = Arc::new(WorkerPool::new(
            self.queue.clone(),
            reconciler,
            self.config.worker_count,
            self.config.max_retry,
        ));
        pool.run(shutdown).await;

        if let Some(handle) = resync {
            handle.abort();
        }
        for handle in feeds {
            handle.abort();
        }
        info!(controller = %self.config.name, "Controller stopped");
    }
}

async fn resync_loop(
    cache: ObjectCache,
    queue: Arc<WorkQueue>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; the initial listing already enqueued everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let sources = cache.sources.list();
                debug!(count = sources.len(), "Resync");
                for source in sources {
                    queue.add(source.key());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ChannelFeed, FeedEvent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use portico_common::{Error, ResourceKey};

    #[derive(Default)]
    struct Recording {
        keys: Mutex<Vec<ResourceKey>>,
    }

    #[async_trait]
    impl Reconciler for Recording {
        async fn reconcile(&self, key: &ResourceKey) -> Result<(), Error> {
            self.keys.lock().push(key.clone());
            Ok(())
        }
    }

    fn svc(name: &str) -> SourceObject {
        SourceObject {
            name: name.to_string(),
            namespace: "gitlab".to_string(),
            resource_version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_five_workers_and_ten_retries() {
        let config = ControllerConfig::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.max_retry, 10);
        assert_eq!(config.backoff, RetryConfig::per_item());
        assert!(config.resync_period.is_none());
    }

    #[test]
    fn router_is_subscribed_to_both_stores() {
        let controller = Controller::new(ControllerConfig::default());
        controller.cache().sources.apply(FeedEvent::Added(svc("web")));
        assert_eq!(controller.queue().len(), 1);
    }

    #[tokio::test]
    async fn run_reconciles_initial_listing_and_stops() {
        let controller = Controller::new(ControllerConfig::default());
        let (src_tx, src_feed) = ChannelFeed::new();
        let (drv_tx, drv_feed) = ChannelFeed::<DerivedObject>::new();
        src_tx.list([svc("web"), svc("api")]);
        drv_tx.list([]);

        let reconciler = Arc::new(Recording::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.run(
            Arc::new(src_feed),
            Arc::new(drv_feed),
            reconciler.clone(),
            shutdown.clone(),
        ));

        for _ in 0..100 {
            if reconciler.keys.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let mut keys = reconciler.keys.lock().clone();
        keys.sort();
        assert_eq!(keys, vec![ResourceKey::from("gitlab/api"), ResourceKey::from("gitlab/web")]);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_enqueues_every_cached_source() {
        let cache = ObjectCache::new();
        cache.sources.apply(FeedEvent::Added(svc("web")));
        let queue = Arc::new(WorkQueue::new("test"));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(resync_loop(
            cache,
            queue.clone(),
            Duration::from_secs(30),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
