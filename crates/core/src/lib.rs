//! carctl core types: the mirrored `Car` snapshot, watch events and the
//! capabilities the controller consumes (object store, event recorder).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod capability;
mod key;
mod scheme;

pub use capability::{EventRecorder, EventType, ObjectStore, RecordError, StoreError, WatchStream};
pub use key::{KeyError, ObjectKey};
pub use scheme::{add_to_scheme, GroupVersionKind, Scheme, GROUP, KIND, VERSION};

/// Name used as event source and as field manager for writes.
pub const CONTROLLER_NAME: &str = "car-controller";

/// Desired state of a `Car`: the `status` field plus any extra spec fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CarSpec {
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CarSpec {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self { status: status.into(), extra: BTreeMap::new() }
    }
}

/// Read-only snapshot of a managed object as last observed from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CarObject {
    pub key: ObjectKey,
    pub uid: Option<String>,
    /// Opaque version token; only compared for equality.
    pub resource_version: String,
    pub spec: CarSpec,
}

impl CarObject {
    pub fn new(key: ObjectKey, resource_version: impl Into<String>, spec: CarSpec) -> Self {
        Self { key, uid: None, resource_version: resource_version.into(), spec }
    }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.key.name }
}

/// Raw change coming off a store watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Object created or modified; the consumer decides which from prior state.
    Applied(CarObject),
    Deleted(CarObject),
    /// Full relist. Anything not in the list is gone.
    Restarted(Vec<CarObject>),
}

/// A deleted object as seen by event handlers.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// Deletion observed directly on the watch stream.
    Known(Arc<CarObject>),
    /// Deletion inferred from a relist; `obj` is the last state we had cached.
    FinalStateUnknown { key: ObjectKey, obj: Arc<CarObject> },
}

impl DeletedObject {
    /// Identity of the deleted object, valid for tombstones too.
    pub fn key(&self) -> &ObjectKey {
        match self {
            DeletedObject::Known(obj) => &obj.key,
            DeletedObject::FinalStateUnknown { key, .. } => key,
        }
    }
}

/// Normalized cache mutation delivered to subscribed handlers.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Arc<CarObject>),
    Updated { old: Arc<CarObject>, new: Arc<CarObject> },
    Deleted(DeletedObject),
}

impl Notification {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Notification::Added(obj) => &obj.key,
            Notification::Updated { new, .. } => &new.key,
            Notification::Deleted(d) => d.key(),
        }
    }
}
