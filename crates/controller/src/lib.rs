//! carctl controller: cache notifications feed a rate-limited work queue,
//! a fixed pool of workers drains it and drives each `Car` toward its
//! desired state.
//!
//! Lifecycle: `Created -> CacheSyncing -> Running -> Draining -> Stopped`.
//! A controller runs once; cancelling the token passed to [`Controller::run`]
//! stops the queue, lets in-flight syncs finish and joins the workers.

#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use carctl_core::{EventRecorder, ObjectKey, ObjectStore, Scheme, KIND};
use carctl_queue::{RateLimiter, RateLimitingQueue};
use carctl_store::{Cache, Informer, Subscription};
use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
mod dispatch;
mod reconcile;
mod recorder;

pub use config::ControllerConfig;
pub use dispatch::EnqueueHandler;
pub use reconcile::{
    ConvergePolicy, DefaultStatusPolicy, MirrorPolicy, ReconcileError, SyncOutcome, MESSAGE_RESOURCE_SYNCED,
    SUCCESS_SYNCED,
};
pub use recorder::LogRecorder;

use reconcile::Reconciler;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),
    #[error("controller already started")]
    AlreadyStarted,
    #[error("kind {0} is not registered in the scheme")]
    UnregisteredKind(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    CacheSyncing,
    Running,
    Draining,
    Stopped,
}

/// Assembles a [`Controller`] from its capabilities.
pub struct ControllerBuilder<S, R> {
    store: Arc<S>,
    recorder: Arc<R>,
    policy: Arc<dyn ConvergePolicy>,
    limiter: Option<Arc<dyn RateLimiter<String>>>,
    config: ControllerConfig,
}

impl<S: ObjectStore, R: EventRecorder> ControllerBuilder<S, R> {
    pub fn new(store: Arc<S>, recorder: Arc<R>) -> Self {
        Self { store, recorder, policy: Arc::new(MirrorPolicy), limiter: None, config: ControllerConfig::default() }
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: impl ConvergePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Replace the limiter derived from the config.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter<String>>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Subscribe to `informer` and create the work queue. Needs a Tokio runtime.
    pub fn build(self, informer: &Informer<S>, scheme: &Scheme) -> Result<Controller<S, R>, ControllerError> {
        if !scheme.recognizes(KIND) {
            return Err(ControllerError::UnregisteredKind(KIND.to_string()));
        }
        self.config.validate()?;
        let limiter: Arc<dyn RateLimiter<String>> = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(self.config.rate_limiter()),
        };
        let queue = RateLimitingQueue::with_limiter(self.config.queue_name.clone(), limiter);
        let subscription = informer.subscribe(Arc::new(EnqueueHandler::new(queue.clone())));
        let (phase, _) = watch::channel(Phase::Created);
        debug!(queue = %self.config.queue_name, workers = self.config.workers, "controller built");
        Ok(Controller {
            inner: Arc::new(Inner {
                reconciler: Reconciler {
                    cache: informer.cache(),
                    store: self.store,
                    recorder: self.recorder,
                    policy: self.policy,
                },
                queue,
                config: self.config,
                phase,
                subscription: Mutex::new(Some(subscription)),
            }),
        })
    }
}

struct Inner<S, R> {
    reconciler: Reconciler<S, R>,
    queue: RateLimitingQueue<String>,
    config: ControllerConfig,
    phase: watch::Sender<Phase>,
    subscription: Mutex<Option<Subscription>>,
}

/// Cloneable handle to a controller.
pub struct Controller<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for Controller<S, R> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

/// Marks the key done however processing ends.
struct DoneGuard<'a> {
    queue: &'a RateLimitingQueue<String>,
    key: &'a String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) { self.queue.done(self.key); }
}

impl<S: ObjectStore, R: EventRecorder> Controller<S, R> {
    /// Shorthand for a builder with the default policy and limiter.
    pub fn new(
        store: Arc<S>,
        recorder: Arc<R>,
        informer: &Informer<S>,
        scheme: &Scheme,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        ControllerBuilder::new(store, recorder).config(config).build(informer, scheme)
    }

    pub fn phase(&self) -> Phase { *self.inner.phase.borrow() }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> { self.inner.phase.subscribe() }

    pub fn queue(&self) -> &RateLimitingQueue<String> { &self.inner.queue }

    pub fn cache(&self) -> &Cache { &self.inner.reconciler.cache }

    /// Queue `key` for a sync, subject to the rate limiter.
    pub fn enqueue(&self, key: &ObjectKey) { self.inner.queue.add_rate_limited(key.to_string()); }

    /// Converge the object under `key`. Does not touch the queue.
    pub async fn sync_handler(&self, key: &str) -> Result<SyncOutcome, ReconcileError> {
        self.inner.reconciler.sync(key).await
    }

    /// Take one key off the queue and sync it. `false` once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let inner = &self.inner;
        let Some(key) = inner.queue.get().await else { return false };
        let _done = DoneGuard { queue: &inner.queue, key: &key };

        let t0 = Instant::now();
        let res = AssertUnwindSafe(inner.reconciler.sync(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(panic.as_ref()))));
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);

        match res {
            Ok(outcome) => {
                counter!("reconcile_total", 1u64, "result" => "success");
                inner.queue.forget(&key);
                info!(key = %key, ?outcome, "successfully synced");
            }
            Err(e) if !e.is_retryable() => {
                counter!("reconcile_total", 1u64, "result" => "dropped");
                inner.queue.forget(&key);
                error!(key = %key, error = %e, "dropping work item");
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "result" => "error");
                let retries = inner.queue.num_requeues(&key);
                match inner.config.max_retries {
                    Some(max) if retries >= max => {
                        inner.queue.forget(&key);
                        error!(key = %key, error = %e, retries, "giving up after max retries");
                    }
                    _ => {
                        warn!(key = %key, error = %e, retries, "error syncing; requeuing");
                        inner.queue.add_rate_limited(key.clone());
                    }
                }
            }
        }
        true
    }

    /// Wait for the cache, start the workers and block until `cancel` fires and
    /// every in-flight sync has finished.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        if !self.transition(Phase::Created, Phase::CacheSyncing) {
            return Err(ControllerError::AlreadyStarted);
        }
        info!("starting car controller");
        info!("waiting for informer caches to sync");
        if let Err(e) = self.wait_for_sync(&cancel).await {
            self.stop();
            return Err(e);
        }

        let workers = self.inner.config.workers;
        info!(workers, "starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let ctl = self.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "worker started");
                    while ctl.process_next_work_item().await {}
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();
        self.transition(Phase::CacheSyncing, Phase::Running);
        info!("started workers");

        cancel.cancelled().await;
        info!("shutting down workers");
        self.transition(Phase::Running, Phase::Draining);
        self.inner.queue.shut_down_with_drain().await;
        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        self.stop();
        Ok(())
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let timeout = self.inner.config.cache_sync_timeout;
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.inner.reconciler.cache.wait_for_sync() => Ok(()),
            _ = cancel.cancelled() => Err(ControllerError::CacheSync("cancelled before initial list".to_string())),
            _ = deadline => Err(ControllerError::CacheSync(format!("timed out after {:?}", timeout.unwrap_or_default()))),
        }
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.inner.phase.send_if_modified(|p| {
            if *p != from {
                return false;
            }
            *p = to;
            true
        })
    }

    fn stop(&self) {
        self.inner.queue.shut_down();
        if let Some(sub) = self.inner.subscription.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sub.cancel();
        }
        self.inner.phase.send_replace(Phase::Stopped);
        info!("controller stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
