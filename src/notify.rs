//! In-memory publish/subscribe for wake-up signals.
//!
//! Topics are node ids plus a couple of well-known global keys. A
//! notification carries no data; it only tells the subscriber to go and
//! re-read the store. Each subscriber owns a channel of capacity one, so a
//! burst of publishes collapses into a single pending wake-up and a
//! publisher never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Topic woken on every task mutation.
pub const TASKS_TOPIC: &str = "__tasks__";

/// Topic for a key-value namespace.
pub fn kv_topic(namespace: &str) -> String {
    format!("__kv__:{}", namespace)
}

type Subscribers = HashMap<String, HashMap<u64, mpsc::Sender<()>>>;

/// Best-effort notifier. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct Notifier {
    subs: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to a topic.
    ///
    /// Dropping or cancelling the returned [`Subscription`] unregisters it.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        Subscription {
            rx,
            topic: topic.to_string(),
            id,
            notifier: self.clone(),
        }
    }

    /// Wake every subscriber of `topic`. Subscribers with a wake-up already
    /// pending are skipped.
    pub fn publish(&self, topic: &str) {
        let subs = self.lock();
        if let Some(topic_subs) = subs.get(topic) {
            for tx in topic_subs.values() {
                let _ = tx.try_send(());
            }
        }
    }

    /// Wake global task watchers.
    pub fn publish_tasks(&self) {
        self.publish(TASKS_TOPIC);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut subs = self.lock();
        if let Some(topic_subs) = subs.get_mut(topic) {
            topic_subs.remove(&id);
            if topic_subs.is_empty() {
                subs.remove(topic);
            }
        }
    }
}

/// Receiving half of a subscription.
pub struct Subscription {
    rx: mpsc::Receiver<()>,
    topic: String,
    id: u64,
    notifier: Notifier,
}

impl Subscription {
    /// Wait for the next wake-up. Returns `None` once cancelled.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Non-blocking check for a pending wake-up.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unregister from the notifier.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(&self.topic, self.id);
    }
}
