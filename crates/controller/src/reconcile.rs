//! The per-key sync routine and the policy deciding what "converged" means.

use std::sync::Arc;

use carctl_core::{CarObject, CarSpec, EventRecorder, EventType, KeyError, ObjectKey, ObjectStore, StoreError};
use carctl_store::Cache;
use thiserror::Error;
use tracing::{debug, warn};

/// Event reason recorded after a successful sync.
pub const SUCCESS_SYNCED: &str = "Synced";
/// Event message recorded after a successful sync.
pub const MESSAGE_RESOURCE_SYNCED: &str = "Car synced successfully";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid resource key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("sync panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Malformed keys never become valid, everything else may.
    pub fn is_retryable(&self) -> bool { !matches!(self, ReconcileError::InvalidKey(_)) }
}

/// Maps an observed object to the spec the controller wants in the store.
pub trait ConvergePolicy: Send + Sync {
    fn desired(&self, observed: &CarObject) -> CarSpec;
}

/// Desired state is the observed state: the sync is a create-or-update of what
/// the cache holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorPolicy;

impl ConvergePolicy for MirrorPolicy {
    fn desired(&self, observed: &CarObject) -> CarSpec { observed.spec.clone() }
}

/// Fills in `status` when the object has none.
#[derive(Debug, Clone)]
pub struct DefaultStatusPolicy {
    pub status: String,
}

impl DefaultStatusPolicy {
    pub fn new(status: impl Into<String>) -> Self { Self { status: status.into() } }
}

impl Default for DefaultStatusPolicy {
    fn default() -> Self { Self::new("idle") }
}

impl ConvergePolicy for DefaultStatusPolicy {
    fn desired(&self, observed: &CarObject) -> CarSpec {
        let mut spec = observed.spec.clone();
        if spec.status.is_empty() {
            spec.status = self.status.clone();
        }
        spec
    }
}

/// What a successful sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Desired state written and the `Synced` event recorded.
    Applied,
    /// No object under the key; nothing to do.
    Gone,
}

/// Everything a sync needs: the cache to read from, the store to write to and
/// the recorder to report through.
pub(crate) struct Reconciler<S, R> {
    pub(crate) cache: Cache,
    pub(crate) store: Arc<S>,
    pub(crate) recorder: Arc<R>,
    pub(crate) policy: Arc<dyn ConvergePolicy>,
}

impl<S: ObjectStore, R: EventRecorder> Reconciler<S, R> {
    pub(crate) async fn sync(&self, key: &str) -> Result<SyncOutcome, ReconcileError> {
        let key = ObjectKey::parse(key)?;
        let Some(observed) = self.cache.get(&key) else {
            warn!(key = %key, "car in work queue no longer exists");
            return Ok(SyncOutcome::Gone);
        };

        let desired = CarObject { spec: self.policy.desired(&observed), ..(*observed).clone() };
        let namespace = key.namespace.as_deref().unwrap_or_default();
        self.store.create_or_update(namespace, &desired).await?;
        debug!(key = %key, rv = %observed.resource_version, "desired state written");

        if let Err(e) = self.recorder.record(&observed, EventType::Normal, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED).await
        {
            warn!(key = %key, error = %e, "failed to record sync event");
        }
        Ok(SyncOutcome::Applied)
    }
}
