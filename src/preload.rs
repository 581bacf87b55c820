//! Background preloading of media next to the current window.

use crate::backend::MediaBackend;
use crate::cache::SharedCache;
use crate::error::Error;
use crate::media::MediaItem;
use crate::resource::Fidelity;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// One item to warm, tagged with the cache generation that requested it.
#[derive(Debug, Clone)]
pub struct PreloadJob {
    pub item: MediaItem,
    pub generation: u64,
}

/// What happened to a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    Cached,
    /// Already cached when its turn came.
    Skipped,
    /// The cache was cleared since the job was queued.
    Stale,
    TimedOut,
    Failed,
}

/// Serialized preload queue.
///
/// `enqueue` replaces the queue wholesale; only the latest window's
/// neighbours matter. Jobs run one at a time so at most one resource is ever
/// being materialized by the scheduler.
pub struct PreloadScheduler {
    cache: SharedCache,
    backend: Arc<dyn MediaBackend>,
    timeout: Duration,
    queue: Mutex<VecDeque<PreloadJob>>,
    busy: Mutex<()>,
    notify: Notify,
}

impl PreloadScheduler {
    pub fn new(cache: SharedCache, backend: Arc<dyn MediaBackend>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache,
            backend,
            timeout,
            queue: Mutex::new(VecDeque::new()),
            busy: Mutex::new(()),
            notify: Notify::new(),
        })
    }

    /// Replace the queue and wake the worker.
    pub async fn enqueue(&self, jobs: Vec<PreloadJob>) {
        if jobs.is_empty() {
            self.queue.lock().await.clear();
            return;
        }
        tracing::debug!("Queueing {} items for preload", jobs.len());
        *self.queue.lock().await = jobs.into();
        self.notify.notify_one();
    }

    /// Drop queued work, e.g. on category change.
    pub async fn discard(&self) {
        let mut queue = self.queue.lock().await;
        if !queue.is_empty() {
            tracing::debug!("Discarding {} queued preloads", queue.len());
        }
        queue.clear();
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Process queued jobs one after another until the queue is empty.
    pub async fn pump(&self) -> Vec<(String, PreloadOutcome)> {
        let _busy = self.busy.lock().await;
        let mut outcomes = Vec::new();
        loop {
            let Some(job) = self.queue.lock().await.pop_front() else {
                break;
            };
            let key = job.item.url.clone();
            let outcome = self.process(job).await;
            tracing::debug!("Preload {}: {:?}", key, outcome);
            outcomes.push((key, outcome));
        }
        outcomes
    }

    async fn process(&self, job: PreloadJob) -> PreloadOutcome {
        {
            let cache = self.cache.read().await;
            if cache.generation() != job.generation {
                return PreloadOutcome::Stale;
            }
            if cache.has(&job.item.url) {
                return PreloadOutcome::Skipped;
            }
        }

        let materialize = self.backend.materialize(&job.item, Fidelity::Preview);
        let resource = match tokio::time::timeout(self.timeout, materialize).await {
            Ok(Ok(resource)) => resource,
            Ok(Err(e)) => {
                tracing::debug!("Preload of {} failed: {}", job.item.url, e);
                return PreloadOutcome::Failed;
            }
            Err(_) => {
                tracing::debug!(
                    "Preload of {} abandoned: {}",
                    job.item.url,
                    Error::Timeout(self.timeout)
                );
                return PreloadOutcome::TimedOut;
            }
        };

        let mut cache = self.cache.write().await;
        if cache.put_if_current(job.generation, job.item.url.clone(), resource) {
            PreloadOutcome::Cached
        } else {
            PreloadOutcome::Stale
        }
    }

    /// Run `pump` whenever new work is queued.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                scheduler.notify.notified().await;
                scheduler.pump().await;
            }
        })
    }
}
