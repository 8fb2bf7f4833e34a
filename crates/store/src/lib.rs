//! carctl local cache: an informer that mirrors the object store through
//! list + watch and hands normalized notifications to subscribed handlers.
//!
//! The informer task is the only writer. Readers (workers) do point lookups
//! through [`Cache`] handles while mutations are being applied.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use carctl_core::{CarObject, DeletedObject, Notification, ObjectKey, ObjectStore, StoreEvent};
use futures::StreamExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod memory;

const LIST_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const LIST_BACKOFF_MAX: Duration = Duration::from_secs(30);
const RELIST_PAUSE: Duration = Duration::from_millis(100);

type Items = FxHashMap<ObjectKey, Arc<CarObject>>;

struct CacheInner {
    items: RwLock<Items>,
    synced: watch::Sender<bool>,
}

/// Read handle onto the mirrored object set. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { inner: Arc::new(CacheInner { items: RwLock::new(FxHashMap::default()), synced }) }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<CarObject>> {
        self.inner.items.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.inner.items.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> =
            self.inner.items.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.inner.items.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// True once the initial full listing has been applied.
    pub fn has_synced(&self) -> bool { *self.inner.synced.borrow() }

    pub async fn wait_for_sync(&self) {
        let mut rx = self.inner.synced.subscribe();
        // The sender lives as long as `self`, so this only returns once synced.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn mark_synced(&self) { self.inner.synced.send_replace(true); }

    fn apply(&self, ev: StoreEvent) -> Vec<Notification> {
        let mut items = self.inner.items.write().unwrap_or_else(PoisonError::into_inner);
        match ev {
            StoreEvent::Applied(obj) => {
                let new = Arc::new(obj);
                match items.insert(new.key.clone(), Arc::clone(&new)) {
                    Some(old) => vec![Notification::Updated { old, new }],
                    None => vec![Notification::Added(new)],
                }
            }
            StoreEvent::Deleted(obj) => {
                items.remove(&obj.key);
                vec![Notification::Deleted(DeletedObject::Known(Arc::new(obj)))]
            }
            StoreEvent::Restarted(list) => replace(&mut items, list),
        }
    }

    fn resync(&self) -> Vec<Notification> {
        let items = self.inner.items.read().unwrap_or_else(PoisonError::into_inner);
        items
            .values()
            .map(|obj| Notification::Updated { old: Arc::clone(obj), new: Arc::clone(obj) })
            .collect()
    }
}

/// Swap in a full relist. Objects that disappeared become tombstones; objects
/// already cached at the same resource version produce no notification.
fn replace(items: &mut Items, list: Vec<CarObject>) -> Vec<Notification> {
    let fresh_keys: FxHashSet<ObjectKey> = list.iter().map(|o| o.key.clone()).collect();
    let mut gone: Vec<ObjectKey> = items.keys().filter(|k| !fresh_keys.contains(*k)).cloned().collect();
    gone.sort();

    let mut out = Vec::with_capacity(list.len() + gone.len());
    for key in gone {
        if let Some(obj) = items.remove(&key) {
            out.push(Notification::Deleted(DeletedObject::FinalStateUnknown { key, obj }));
        }
    }
    for obj in list {
        if items.get(&obj.key).is_some_and(|old| old.resource_version == obj.resource_version) {
            continue;
        }
        let new = Arc::new(obj);
        match items.insert(new.key.clone(), Arc::clone(&new)) {
            Some(old) => out.push(Notification::Updated { old, new }),
            None => out.push(Notification::Added(new)),
        }
    }
    out
}

/// Receives cache notifications, synchronously and in order, on the informer task.
/// Implementations must not block.
pub trait EventHandler: Send + Sync {
    fn on_notification(&self, n: &Notification);
}

type Handlers = Mutex<Vec<(u64, Arc<dyn EventHandler>)>>;

/// Registration returned by [`Informer::subscribe`].
pub struct Subscription {
    id: u64,
    handlers: Weak<Handlers>,
    cache: Cache,
}

impl Subscription {
    /// Same barrier as the cache: the initial listing has been delivered.
    pub fn has_synced(&self) -> bool { self.cache.has_synced() }

    /// Stop delivering notifications to this handler.
    pub fn cancel(self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.lock().unwrap_or_else(PoisonError::into_inner).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Single-writer list+watch loop populating a [`Cache`].
pub struct Informer<S: ObjectStore> {
    store: Arc<S>,
    cache: Cache,
    handlers: Arc<Handlers>,
    next_id: AtomicU64,
    resync: Option<Duration>,
}

impl<S: ObjectStore> Informer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: Cache::new(),
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            resync: None,
        }
    }

    /// Periodically redeliver every cached object as an unchanged update.
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    pub fn cache(&self) -> Cache { self.cache.clone() }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).push((id, handler));
        Subscription { id, handlers: Arc::downgrade(&self.handlers), cache: self.cache.clone() }
    }

    pub fn unsubscribe(&self, subscription: Subscription) { subscription.cancel(); }

    /// Run until `cancel` fires: list, mark synced, then follow the watch,
    /// relisting whenever the watch ends.
    ///
    /// The explicit `list` is the sync barrier and the one place a failing
    /// store is retried with backoff. The `Restarted` snapshot every watch
    /// opens with is applied like any relist, so objects the list already
    /// delivered at the same version are not announced twice.
    pub async fn run(self, cancel: CancellationToken) {
        info!(resync_secs = ?self.resync.map(|d| d.as_secs()), "informer started");
        let mut backoff = LIST_BACKOFF_INITIAL;
        'outer: loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.store.list() => r,
            };
            match listed {
                Ok(items) => {
                    let count = items.len();
                    self.dispatch(self.cache.apply(StoreEvent::Restarted(items)));
                    if !self.cache.has_synced() {
                        info!(count, "cache synced");
                    }
                    self.cache.mark_synced();
                    backoff = LIST_BACKOFF_INITIAL;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "list failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(LIST_BACKOFF_MAX);
                    continue;
                }
            }

            let mut stream = self.store.watch();
            let mut resync = self.resync.map(|p| interval_at(Instant::now() + p, p));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    ev = stream.next() => match ev {
                        Some(Ok(ev)) => {
                            let notes = self.cache.apply(ev);
                            self.dispatch(notes);
                        }
                        Some(Err(e)) => warn!(error = %e, "watch error"),
                        None => {
                            warn!("watch stream ended; relisting");
                            break;
                        }
                    },
                    _ = tick(&mut resync) => {
                        let notes = self.cache.resync();
                        debug!(count = notes.len(), "resync");
                        self.dispatch(notes);
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RELIST_PAUSE) => {}
            }
        }
        info!("informer stopped");
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for n in &notes {
            let kind = match n {
                Notification::Added(_) => "added",
                Notification::Updated { .. } => "updated",
                Notification::Deleted(_) => "deleted",
            };
            counter!("informer_events_total", 1u64, "type" => kind);
            for h in &handlers {
                h.on_notification(n);
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carctl_core::CarSpec;

    fn car(ns: &str, name: &str, rv: &str) -> CarObject {
        CarObject::new(ObjectKey::namespaced(ns, name), rv, CarSpec::with_status("idle"))
    }

    #[test]
    fn applied_splits_into_add_and_update() {
        let cache = Cache::new();
        let n1 = cache.apply(StoreEvent::Applied(car("default", "car1", "1")));
        assert!(matches!(n1.as_slice(), [Notification::Added(_)]));
        let n2 = cache.apply(StoreEvent::Applied(car("default", "car1", "2")));
        match n2.as_slice() {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.resource_version, "1");
                assert_eq!(new.resource_version, "2");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cache.get(&ObjectKey::namespaced("default", "car1")).unwrap().resource_version, "2");
    }

    #[test]
    fn relist_tombstones_missing_objects() {
        let cache = Cache::new();
        cache.apply(StoreEvent::Restarted(vec![car("default", "a", "1"), car("default", "b", "1")]));
        let notes = cache.apply(StoreEvent::Restarted(vec![car("default", "a", "1")]));
        assert_eq!(notes.len(), 1);
        match &notes[0] {
            Notification::Deleted(DeletedObject::FinalStateUnknown { key, obj }) => {
                assert_eq!(key, &ObjectKey::namespaced("default", "b"));
                assert_eq!(obj.resource_version, "1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cache.keys(), vec![ObjectKey::namespaced("default", "a")]);
    }

    #[test]
    fn relist_announces_only_changed_versions() {
        let cache = Cache::new();
        cache.apply(StoreEvent::Restarted(vec![car("default", "a", "1"), car("default", "b", "1")]));
        let notes = cache.apply(StoreEvent::Restarted(vec![
            car("default", "a", "1"),
            car("default", "b", "2"),
            car("default", "c", "1"),
        ]));
        let tags: Vec<String> = notes
            .iter()
            .map(|n| match n {
                Notification::Added(o) => format!("add {}", o.key),
                Notification::Updated { old, new } => {
                    format!("update {} {}->{}", new.key, old.resource_version, new.resource_version)
                }
                Notification::Deleted(d) => format!("delete {}", d.key()),
            })
            .collect();
        assert_eq!(tags, vec!["update default/b 1->2", "add default/c"]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn delete_of_unknown_object_still_notifies() {
        let cache = Cache::new();
        let notes = cache.apply(StoreEvent::Deleted(car("default", "ghost", "3")));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].key().name, "ghost");
        assert!(cache.is_empty());
    }

    struct Count(std::sync::atomic::AtomicUsize);

    impl EventHandler for Count {
        fn on_notification(&self, _n: &Notification) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn unsubscribed_handler_is_skipped() {
        let informer = Informer::new(Arc::new(crate::memory::MemoryStore::new()));
        let kept = Arc::new(Count(Default::default()));
        let dropped = Arc::new(Count(Default::default()));
        let _keep = informer.subscribe(kept.clone());
        let sub = informer.subscribe(dropped.clone());
        informer.unsubscribe(sub);
        informer.dispatch(informer.cache.apply(StoreEvent::Applied(car("default", "car1", "1"))));
        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resync_redelivers_identical_versions() {
        let cache = Cache::new();
        cache.apply(StoreEvent::Applied(car("default", "car1", "5")));
        let notes = cache.resync();
        match notes.as_slice() {
            [Notification::Updated { old, new }] => assert_eq!(old.resource_version, new.resource_version),
            other => panic!("unexpected {:?}", other),
        }
    }
}
