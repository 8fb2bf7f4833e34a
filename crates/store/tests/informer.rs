#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use carctl_core::{CarSpec, DeletedObject, Notification, ObjectKey, StoreError};
use carctl_store::memory::MemoryStore;
use carctl_store::{EventHandler, Informer};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<String>>,
}

impl EventHandler for Collect {
    fn on_notification(&self, n: &Notification) {
        let tag = match n {
            Notification::Added(o) => format!("add {} rv={}", o.key, o.resource_version),
            Notification::Updated { old, new } => {
                format!("update {} rv={}->{}", new.key, old.resource_version, new.resource_version)
            }
            Notification::Deleted(DeletedObject::Known(o)) => format!("delete {}", o.key),
            Notification::Deleted(DeletedObject::FinalStateUnknown { key, obj }) => {
                format!("tombstone {} rv={}", key, obj.resource_version)
            }
        };
        self.seen.lock().unwrap().push(tag);
    }
}

impl Collect {
    fn take(&self) -> Vec<String> { std::mem::take(&mut *self.seen.lock().unwrap()) }
}

async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..100 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_barrier_waits_for_initial_list() {
    let store = Arc::new(MemoryStore::with_objects([(ObjectKey::namespaced("default", "car1"), CarSpec::with_status("idle"))]));
    store.hold_lists();

    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cache.has_synced());
    assert!(!sub.has_synced());
    assert!(handler.take().is_empty());

    store.release_lists();
    tokio::time::timeout(Duration::from_secs(1), cache.wait_for_sync()).await.unwrap();
    assert!(sub.has_synced());
    assert!(cache.contains(&ObjectKey::namespaced("default", "car1")));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_events_reach_handlers_in_order() {
    let store = Arc::new(MemoryStore::new());
    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let _sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    cache.wait_for_sync().await;
    eventually(|| store.watchers() > 0).await;

    let key = ObjectKey::namespaced("default", "car1");
    store.upsert(key.clone(), CarSpec::with_status("idle"));
    store.upsert(key.clone(), CarSpec::with_status("driving"));
    store.delete(&key);

    eventually(|| handler.seen.lock().unwrap().len() >= 3).await;
    assert_eq!(
        handler.take(),
        vec!["add default/car1 rv=1", "update default/car1 rv=1->2", "delete default/car1"]
    );
    assert!(!cache.contains(&key));

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_redelivers_unchanged_objects() {
    let store = Arc::new(MemoryStore::with_objects([(ObjectKey::namespaced("default", "car1"), CarSpec::with_status("idle"))]));
    let informer = Informer::new(Arc::clone(&store)).with_resync(Some(Duration::from_millis(30)));
    let handler = Arc::new(Collect::default());
    let _sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    eventually(|| handler.seen.lock().unwrap().iter().filter(|s| s.as_str() == "update default/car1 rv=1->1").count() >= 2).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_subscription_stops_receiving() {
    let store = Arc::new(MemoryStore::new());
    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    cache.wait_for_sync().await;

    sub.cancel();
    store.upsert(ObjectKey::namespaced("default", "car1"), CarSpec::with_status("idle"));
    eventually(|| cache.contains(&ObjectKey::namespaced("default", "car1"))).await;
    assert!(handler.take().is_empty());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_objects_are_announced_once() {
    let store = Arc::new(MemoryStore::with_objects([
        (ObjectKey::namespaced("default", "car1"), CarSpec::with_status("idle")),
        (ObjectKey::namespaced("default", "car2"), CarSpec::with_status("idle")),
    ]));
    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let _sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    cache.wait_for_sync().await;
    eventually(|| store.watchers() > 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The watch opens with the same snapshot the list returned.
    assert_eq!(handler.take(), vec!["add default/car1 rv=1", "add default/car2 rv=2"]);
    assert_eq!(store.list_calls(), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_list_is_retried_until_synced() {
    let store = Arc::new(MemoryStore::with_objects([(ObjectKey::namespaced("default", "car1"), CarSpec::with_status("idle"))]));
    store.fail_next_list(StoreError::Transport("connection refused".into()));
    store.fail_next_list(StoreError::Transport("connection refused".into()));

    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let _sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));

    eventually(|| store.list_calls() >= 1).await;
    assert!(!cache.has_synced());
    tokio::time::timeout(Duration::from_secs(2), cache.wait_for_sync()).await.unwrap();
    assert_eq!(store.list_calls(), 3);
    assert!(cache.contains(&ObjectKey::namespaced("default", "car1")));
    assert_eq!(handler.take(), vec!["add default/car1 rv=1"]);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_missed_between_watches_becomes_tombstone() {
    let key = ObjectKey::namespaced("default", "car1");
    let store = Arc::new(MemoryStore::with_objects([
        (key.clone(), CarSpec::with_status("idle")),
        (ObjectKey::namespaced("default", "car2"), CarSpec::with_status("idle")),
    ]));
    let informer = Informer::new(Arc::clone(&store));
    let cache = informer.cache();
    let handler = Arc::new(Collect::default());
    let _sub = informer.subscribe(handler.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(informer.run(cancel.clone()));
    cache.wait_for_sync().await;
    eventually(|| store.watchers() > 0).await;
    handler.take();

    store.hold_lists();
    store.end_watches();
    eventually(|| store.watchers() == 0).await;
    store.delete(&key);
    assert!(cache.contains(&key));

    store.release_lists();
    eventually(|| !cache.contains(&key)).await;
    eventually(|| store.watchers() > 0).await;
    assert_eq!(handler.take(), vec!["tombstone default/car1 rv=1"]);
    assert_eq!(store.list_calls(), 2);
    assert_eq!(cache.keys(), vec![ObjectKey::namespaced("default", "car2")]);

    cancel.cancel();
    task.await.unwrap();
}
