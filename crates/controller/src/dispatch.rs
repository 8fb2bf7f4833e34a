//! Cache notifications to queue keys.

use carctl_core::Notification;
use carctl_queue::RateLimitingQueue;
use carctl_store::EventHandler;
use metrics::counter;
use tracing::trace;

/// Turns every cache notification into a rate-limited enqueue of the object's
/// `namespace/name` key. Updates that carry the same resource version on both
/// sides (periodic resync, replayed watch events) are dropped.
pub struct EnqueueHandler {
    queue: RateLimitingQueue<String>,
}

impl EnqueueHandler {
    pub fn new(queue: RateLimitingQueue<String>) -> Self { Self { queue } }
}

impl EventHandler for EnqueueHandler {
    fn on_notification(&self, n: &Notification) {
        if let Notification::Updated { old, new } = n {
            if old.resource_version == new.resource_version {
                counter!("dispatch_skipped_total", 1u64);
                trace!(key = %new.key, rv = %new.resource_version, "unchanged version; skipping");
                return;
            }
        }
        // Deletes are enqueued too: the sync routine sees the miss and stops.
        self.queue.add_rate_limited(n.key().to_string());
    }
}
