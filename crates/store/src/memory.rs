//! In-process object store and event recorder. Used by tests and by the
//! `demo` mode of the binary.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use carctl_core::{
    CarObject, CarSpec, EventRecorder, EventType, ObjectKey, ObjectStore, RecordError, StoreError, StoreEvent,
    WatchStream,
};
use futures::{stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

const WATCH_CAPACITY: usize = 1024;

/// One `create_or_update` call as seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreAction {
    pub namespace: String,
    pub key: ObjectKey,
    pub spec: CarSpec,
    pub ok: bool,
}

struct MemState {
    objects: BTreeMap<ObjectKey, CarObject>,
    rv: u64,
    actions: Vec<StoreAction>,
    failures: VecDeque<StoreError>,
    list_failures: VecDeque<StoreError>,
    list_calls: usize,
}

impl MemState {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }
}

/// Object store kept in memory. Every write bumps a global version counter
/// and is broadcast to open watches.
pub struct MemoryStore {
    state: Mutex<MemState>,
    events: broadcast::Sender<StoreEvent>,
    list_gate: watch::Sender<bool>,
    watch_epoch: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let (list_gate, _) = watch::channel(true);
        let (watch_epoch, _) = watch::channel(0);
        Self {
            state: Mutex::new(MemState {
                objects: BTreeMap::new(),
                rv: 0,
                actions: Vec::new(),
                failures: VecDeque::new(),
                list_failures: VecDeque::new(),
                list_calls: 0,
            }),
            events,
            list_gate,
            watch_epoch,
        }
    }

    pub fn with_objects(objects: impl IntoIterator<Item = (ObjectKey, CarSpec)>) -> Self {
        let store = Self::new();
        for (key, spec) in objects {
            store.upsert(key, spec);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// External write (another client creating or editing an object).
    pub fn upsert(&self, key: ObjectKey, spec: CarSpec) -> CarObject {
        let mut st = self.lock();
        let rv = st.next_rv();
        let uid = st.objects.get(&key).and_then(|o| o.uid.clone()).unwrap_or_else(|| format!("uid-{}", rv));
        let obj = CarObject { key: key.clone(), uid: Some(uid), resource_version: rv, spec };
        st.objects.insert(key, obj.clone());
        // Broadcast under the lock so watches see writes in version order.
        let _ = self.events.send(StoreEvent::Applied(obj.clone()));
        obj
    }

    /// External delete.
    pub fn delete(&self, key: &ObjectKey) -> Option<CarObject> {
        let mut st = self.lock();
        let removed = st.objects.remove(key);
        if let Some(obj) = &removed {
            let _ = self.events.send(StoreEvent::Deleted(obj.clone()));
        }
        removed
    }

    /// Re-send the current state of `key` without bumping its version.
    pub fn redeliver(&self, key: &ObjectKey) -> bool {
        let st = self.lock();
        match st.objects.get(key) {
            Some(obj) => self.events.send(StoreEvent::Applied(obj.clone())).is_ok(),
            None => false,
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<CarObject> { self.lock().objects.get(key).cloned() }

    pub fn actions(&self) -> Vec<StoreAction> { self.lock().actions.clone() }

    /// Number of `list` calls, failed ones included.
    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    /// Number of open watch streams.
    pub fn watchers(&self) -> usize { self.events.receiver_count() }

    /// Make the next `create_or_update` call fail with `err`. Calls queue up.
    pub fn fail_next(&self, err: StoreError) { self.lock().failures.push_back(err); }

    /// Make the next `list` call fail with `err`. Calls queue up.
    pub fn fail_next_list(&self, err: StoreError) { self.lock().list_failures.push_back(err); }

    /// End every open watch stream, as a dropped connection would.
    pub fn end_watches(&self) { self.watch_epoch.send_modify(|e| *e += 1); }

    /// Block `list` until [`MemoryStore::release_lists`] is called.
    pub fn hold_lists(&self) { self.list_gate.send_replace(false); }

    pub fn release_lists(&self) { self.list_gate.send_replace(true); }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self) -> Result<Vec<CarObject>, StoreError> {
        let mut gate = self.list_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let mut st = self.lock();
        st.list_calls += 1;
        if let Some(err) = st.list_failures.pop_front() {
            return Err(err);
        }
        Ok(st.objects.values().cloned().collect())
    }

    fn watch(&self) -> WatchStream {
        let (initial, rx, epoch) = {
            let st = self.lock();
            (st.objects.values().cloned().collect::<Vec<_>>(), self.events.subscribe(), self.watch_epoch.subscribe())
        };
        let head = stream::once(async move { Ok(StoreEvent::Restarted(initial)) });
        let tail = stream::unfold((rx, epoch), |(mut rx, mut epoch)| async move {
            let res = tokio::select! {
                biased;
                _ = epoch.changed() => {
                    debug!("memory watch ended");
                    return None;
                }
                res = rx.recv() => res,
            };
            match res {
                Ok(ev) => Some((Ok(ev), (rx, epoch))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // End the stream; the informer relists.
                    warn!(skipped = n, "memory watch lagged");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        head.chain(tail).boxed()
    }

    async fn create_or_update(&self, namespace: &str, obj: &CarObject) -> Result<(), StoreError> {
        let mut st = self.lock();
        if let Some(err) = st.failures.pop_front() {
            st.actions.push(StoreAction { namespace: namespace.to_string(), key: obj.key.clone(), spec: obj.spec.clone(), ok: false });
            return Err(err);
        }
        st.actions.push(StoreAction { namespace: namespace.to_string(), key: obj.key.clone(), spec: obj.spec.clone(), ok: true });

        let key = ObjectKey { namespace: Some(namespace.to_string()).filter(|ns| !ns.is_empty()), name: obj.key.name.clone() };
        if st.objects.get(&key).is_some_and(|cur| cur.spec == obj.spec) {
            debug!(key = %key, "create_or_update: unchanged");
            return Ok(());
        }
        let rv = st.next_rv();
        let uid = st.objects.get(&key).and_then(|o| o.uid.clone()).or_else(|| obj.uid.clone());
        let stored = CarObject { key: key.clone(), uid, resource_version: rv, spec: obj.spec.clone() };
        st.objects.insert(key, stored.clone());
        let _ = self.events.send(StoreEvent::Applied(stored));
        Ok(())
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub key: ObjectKey,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that keeps events in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
    failing: Mutex<bool>,
}

impl MemoryRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> { self.events.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    /// Make every subsequent `record` call fail.
    pub fn set_failing(&self, failing: bool) { *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing; }
}

#[async_trait::async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, obj: &CarObject, type_: EventType, reason: &str, message: &str) -> Result<(), RecordError> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(RecordError("sink unavailable".to_string()));
        }
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedEvent {
            key: obj.key.clone(),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
