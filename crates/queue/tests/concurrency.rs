#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use carctl_queue::{ItemExponentialFailureRateLimiter, ItemState, RateLimitingQueue};

fn queue() -> RateLimitingQueue<String> {
    RateLimitingQueue::new(
        "concurrency",
        ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(20)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_never_processed_by_two_workers() {
    let q = queue();
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let violations = Arc::new(Mutex::new(0usize));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = q.clone();
        let in_flight = Arc::clone(&in_flight);
        let seen = Arc::clone(&seen);
        let violations = Arc::clone(&violations);
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                if !in_flight.lock().unwrap().insert(key.clone()) {
                    *violations.lock().unwrap() += 1;
                }
                assert_ne!(q.item_state(&key), ItemState::Pending);
                tokio::time::sleep(Duration::from_millis(2)).await;
                *seen.lock().unwrap().entry(key.clone()).or_default() += 1;
                in_flight.lock().unwrap().remove(&key);
                q.done(&key);
            }
        }));
    }

    for round in 0..50 {
        for i in 0..5 {
            q.add(format!("default/car{}", i));
        }
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    // Let everything settle, then stop.
    tokio::time::sleep(Duration::from_millis(200)).await;
    q.shut_down();
    for w in workers {
        tokio::time::timeout(Duration::from_secs(2), w).await.unwrap().unwrap();
    }

    assert_eq!(*violations.lock().unwrap(), 0);
    let seen = seen.lock().unwrap();
    for i in 0..5 {
        // Every identity was delivered at least once.
        assert!(seen.get(&format!("default/car{}", i)).copied().unwrap_or(0) >= 1);
    }
}

#[tokio::test]
async fn dirty_item_redelivered_exactly_once() {
    let q = queue();
    let k = "default/car1".to_string();
    q.add(k.clone());
    let got = q.get().await.unwrap();
    for _ in 0..5 {
        q.add(k.clone());
    }
    q.done(&got);

    let again = tokio::time::timeout(Duration::from_millis(100), q.get()).await.unwrap().unwrap();
    assert_eq!(again, k);
    q.done(&again);
    assert!(tokio::time::timeout(Duration::from_millis(50), q.get()).await.is_err(), "redelivered more than once");
}

#[tokio::test]
async fn rate_limited_adds_back_off_and_forget_resets() {
    let q = queue();
    let k = "default/car1".to_string();
    q.add_rate_limited(k.clone());
    q.add_rate_limited(k.clone());
    assert_eq!(q.num_requeues(&k), 2);
    let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
    q.done(&got);
    q.forget(&got);
    assert_eq!(q.num_requeues(&k), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_waits_for_in_flight_items() {
    let q = queue();
    q.add("a".to_string());
    let item = q.get().await.unwrap();

    let finished = Arc::new(Mutex::new(false));
    let worker = {
        let q = q.clone();
        let finished = Arc::clone(&finished);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *finished.lock().unwrap() = true;
            q.done(&item);
        })
    };

    tokio::time::timeout(Duration::from_secs(1), q.shut_down_with_drain()).await.unwrap();
    assert!(*finished.lock().unwrap(), "drain returned before in-flight item completed");
    assert_eq!(q.processing_len(), 0);
    worker.await.unwrap();
}

#[tokio::test]
async fn delayed_items_are_discarded_on_shutdown() {
    let q = queue();
    q.add_after("late".to_string(), Duration::from_millis(20));
    q.shut_down();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(q.len(), 0);
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn far_future_delay_does_not_stall_later_items() {
    let year = Duration::from_secs(365 * 24 * 60 * 60);
    let q: RateLimitingQueue<String> =
        RateLimitingQueue::new("far", ItemExponentialFailureRateLimiter::new(year, 4 * year));
    q.add_after("far".to_string(), 3 * year);
    for _ in 0..8 {
        q.add_rate_limited("backoff".to_string());
    }
    q.add_after("near".to_string(), Duration::from_millis(10));

    let got = tokio::time::timeout(Duration::from_millis(500), q.get()).await.unwrap();
    assert_eq!(got.as_deref(), Some("near"));
    q.done(&"near".to_string());

    q.add_after("again".to_string(), Duration::from_millis(5));
    let got = tokio::time::timeout(Duration::from_millis(500), q.get()).await.unwrap();
    assert_eq!(got.as_deref(), Some("again"));
    assert_eq!(q.item_state(&"far".to_string()), ItemState::Absent);
}
