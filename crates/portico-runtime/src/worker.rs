//! Worker pool
//!
//! A fixed number of tasks pull keys from the [`WorkQueue`], run the
//! [`Reconciler`] and route the outcome through the retry policy. Whatever
//! happens, including a panic inside the reconciler, the key is marked done
//! before the worker moves on.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use portico_common::metrics::ReconcileTimer;
use portico_common::{Error, ResourceKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

/// Brings the world in line with the desired state for one key
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile `key`. Errors are retried according to [`Error::is_retryable`].
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), Error>;
}

/// What the retry policy did with a finished key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconcile succeeded; retry history cleared
    Succeeded,
    /// Reconcile failed and the key was requeued with backoff
    Requeued,
    /// Reconcile failed and the key was dropped
    Dropped,
}

/// Fixed-size pool of reconcile workers
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    max_retry: u32,
}

impl WorkerPool {
    /// Create a pool of `workers` tasks; failing keys are retried up to `max_retry` times
    pub fn new(
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn Reconciler>,
        workers: usize,
        max_retry: u32,
    ) -> Self {
        Self {
            queue,
            reconciler,
            workers: workers.max(1),
            max_retry,
        }
    }

    /// Run the workers until `shutdown` fires and the queue is drained
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(workers = self.workers, queue = %self.queue.name(), "Starting workers");

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let pool = self.clone();
                tokio::spawn(async move {
                    while pool.process_next_item().await {}
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        let queue = self.queue.clone();
        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("Shutdown requested, draining work queue");
            queue.shut_down();
        });

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        stopper.abort();
        info!("All workers stopped");
    }

    /// Process one key from the queue
    ///
    /// Returns `false` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let timer = ReconcileTimer::start();
        let result = std::panic::AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::internal_with_context(
                    "worker",
                    format!("reconcile panicked: {}", panic_message(panic.as_ref())),
                ))
            });

        match &result {
            Ok(()) => timer.success(),
            Err(e) => timer.error(e.kind_label()),
        }

        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    /// Apply the retry policy to a finished reconcile
    pub fn handle_result(&self, key: &ResourceKey, result: Result<(), Error>) -> RetryDecision {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return RetryDecision::Succeeded;
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            error!(key = %key, error = %err, "Reconcile failed permanently, dropping key");
            self.queue.forget(key);
            return RetryDecision::Dropped;
        }

        let retries = self.queue.num_requeues(key);
        if retries < self.max_retry {
            warn!(
                key = %key,
                error = %err,
                retries,
                max_retry = self.max_retry,
                "Reconcile failed, requeueing"
            );
            self.queue.add_rate_limited(key.clone());
            RetryDecision::Requeued
        } else {
            error!(
                key = %key,
                error = %err,
                retries,
                "Reconcile failed after max retries, dropping key"
            );
            self.queue.forget(key);
            RetryDecision::Dropped
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
