use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one WS connection's subscription. Cheap to
/// clone; equality/hash is by id only.
#[derive(Clone)]
pub struct Subscriber {
    pub id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

impl Subscriber {
    pub fn new(sender: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    /// Send-failures are swallowed per the spec's backpressure policy — a
    /// slow/broken subscriber never blocks or panics the publisher.
    pub fn send(&self, message: Value) {
        let _ = self.sender.send(message);
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Subscriber {}

/// Maps view-id → subscriber set and subscriber-id → view-id. Each
/// subscriber appears in at most one view's set (invariant 1).
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_view: HashMap<String, Vec<Subscriber>>,
    view_of: HashMap<u64, String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `sub` to `view_id`, first removing any prior subscription
    /// it held (a connection subscribes to at most one view at a time).
    /// Returns the view-id it was previously subscribed to, if any.
    pub async fn subscribe(&self, sub: Subscriber, view_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let previous = remove_locked(&mut inner, sub.id);
        inner
            .by_view
            .entry(view_id.to_string())
            .or_default()
            .push(sub.clone());
        inner.view_of.insert(sub.id, view_id.to_string());
        previous
    }

    /// Remove a subscriber's subscription entirely. Returns the view-id it
    /// was subscribed to, if any, so the caller can decrement that
    /// session's subscriber count.
    pub async fn unsubscribe(&self, subscriber_id: u64) -> Option<String> {
        let mut inner = self.inner.lock().await;
        remove_locked(&mut inner, subscriber_id)
    }

    pub async fn subscriber_count(&self, view_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.by_view.get(view_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Fan out `message` to every subscriber of `view_id`. Per-send errors
    /// are swallowed inside [`Subscriber::send`].
    pub async fn fan_out(&self, view_id: &str, message: Value) {
        let inner = self.inner.lock().await;
        if let Some(subs) = inner.by_view.get(view_id) {
            for sub in subs {
                sub.send(message.clone());
            }
        }
    }
}

fn remove_locked(inner: &mut Inner, subscriber_id: u64) -> Option<String> {
    let view_id = inner.view_of.remove(&subscriber_id)?;
    if let Some(subs) = inner.by_view.get_mut(&view_id) {
        subs.retain(|s| s.id != subscriber_id);
        if subs.is_empty() {
            inner.by_view.remove(&view_id);
        }
    }
    Some(view_id)
}

pub type SharedRegistry = Arc<SubscriptionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> (Subscriber, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber::new(tx), rx)
    }

    #[tokio::test]
    async fn subscriber_appears_in_at_most_one_view() {
        let reg = SubscriptionRegistry::new();
        let (s, _rx) = sub();
        reg.subscribe(s.clone(), "a").await;
        assert_eq!(reg.subscriber_count("a").await, 1);
        let previous = reg.subscribe(s.clone(), "b").await;
        assert_eq!(previous.as_deref(), Some("a"));
        assert_eq!(reg.subscriber_count("a").await, 0);
        assert_eq!(reg.subscriber_count("b").await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_view() {
        let reg = SubscriptionRegistry::new();
        let (s, _rx) = sub();
        reg.subscribe(s.clone(), "a").await;
        let removed_from = reg.unsubscribe(s.id).await;
        assert_eq!(removed_from.as_deref(), Some("a"));
        assert_eq!(reg.subscriber_count("a").await, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers_of_a_view() {
        let reg = SubscriptionRegistry::new();
        let (s1, mut rx1) = sub();
        let (s2, mut rx2) = sub();
        reg.subscribe(s1, "a").await;
        reg.subscribe(s2, "a").await;
        reg.fan_out("a", serde_json::json!({"type": "frame"})).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
