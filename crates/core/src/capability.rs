//! Capabilities consumed by the controller. Implementations are injected at
//! construction: kube-backed ones live in `carctl-kubehub`, in-memory ones in
//! `carctl-store::memory`.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{CarObject, StoreEvent};

/// Store failures. All of them are treated as transient by the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport: {0}")]
    Transport(String),
}

pub type WatchStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Remote object store proxy: list, watch, create-or-update.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Full listing of the current object set.
    async fn list(&self) -> Result<Vec<CarObject>, StoreError>;

    /// Change feed. Starts with a `Restarted` carrying the full current set,
    /// which the informer collapses against the `list` it made just before.
    fn watch(&self) -> WatchStream;

    /// Idempotent create-or-update of `obj` in `namespace`.
    async fn create_or_update(&self, namespace: &str, obj: &CarObject) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("recording event failed: {0}")]
pub struct RecordError(pub String);

/// Event sink for human-facing object events.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync + 'static {
    async fn record(&self, obj: &CarObject, type_: EventType, reason: &str, message: &str) -> Result<(), RecordError>;
}
