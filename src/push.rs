//! Live push fan-out.
//!
//! The registry maps a site id to its current subscribers, each one an
//! `mpsc` sender feeding a connection task. Delivery never blocks: a
//! subscriber whose queue is full or whose receiver is gone is removed on the
//! spot and delivery to everyone else continues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{Alarm, DailyAggregate, Reading, SiteId};

// ---

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Data,
    Alarm,
    Stat,
    System,
}

/// JSON frame delivered to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// `None` for system-wide broadcasts.
    pub site_id: Option<SiteId>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Envelope {
    // ---
    pub fn new(kind: EventKind, site_id: Option<SiteId>, payload: Value) -> Self {
        Self {
            kind,
            site_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn data(reading: &Reading) -> Result<Self, serde_json::Error> {
        Ok(Self::new(EventKind::Data, Some(reading.site_id), serde_json::to_value(reading)?))
    }

    pub fn alarm(alarm: &Alarm) -> Result<Self, serde_json::Error> {
        Ok(Self::new(EventKind::Alarm, Some(alarm.site_id), serde_json::to_value(alarm)?))
    }

    pub fn stat(aggregate: &DailyAggregate) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            EventKind::Stat,
            Some(aggregate.site_id),
            serde_json::to_value(aggregate)?,
        ))
    }

    pub fn system(message: &str, site_id: Option<SiteId>) -> Self {
        Self::new(EventKind::System, site_id, json!({ "message": message }))
    }
}

/// Outcome of one publish or broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers removed because they could not take the envelope.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PushStats {
    pub subscribers: usize,
    pub sites: usize,
    pub delivered: u64,
    pub dropped: u64,
}

type Sender = mpsc::Sender<Arc<Envelope>>;

#[derive(Default)]
struct Registry {
    by_site: HashMap<SiteId, HashMap<SubscriberId, Sender>>,
    site_of: HashMap<SubscriberId, SiteId>,
}

impl Registry {
    fn remove(&mut self, id: SubscriberId) -> bool {
        // ---
        let Some(site_id) = self.site_of.remove(&id) else {
            return false;
        };
        if let Some(subscribers) = self.by_site.get_mut(&site_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.by_site.remove(&site_id);
            }
        }
        true
    }
}

struct HubInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    buffer: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry.write().remove(id);
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }
}

#[derive(Clone)]
pub struct PushHub {
    inner: Arc<HubInner>,
}

impl PushHub {
    // ---
    /// `buffer` is the outbound queue depth of each subscription created by
    /// [`subscribe`](Self::subscribe).
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Add an existing channel as a subscriber of `site_id`.
    pub fn register(&self, site_id: SiteId, sender: Sender) -> SubscriberId {
        // ---
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.write();
        registry.by_site.entry(site_id).or_default().insert(id, sender);
        registry.site_of.insert(id, site_id);
        drop(registry);

        info!(site_id, subscriber = id, "subscriber registered");
        id
    }

    /// Open a subscription on `site_id`. Dropping it deregisters immediately.
    pub fn subscribe(&self, site_id: SiteId) -> Subscription {
        // ---
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.register(site_id, tx);
        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Idempotent; returns whether `id` was still registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Deliver to every current subscriber of `site_id`.
    pub fn publish(&self, site_id: SiteId, envelope: Envelope) -> Delivery {
        // ---
        let targets: Vec<(SubscriberId, Sender)> = {
            let registry = self.inner.registry.read();
            registry
                .by_site
                .get(&site_id)
                .map(|subs| subs.iter().map(|(id, tx)| (*id, tx.clone())).collect())
                .unwrap_or_default()
        };
        self.deliver(targets, envelope)
    }

    /// Deliver to every subscriber regardless of site.
    pub fn broadcast(&self, envelope: Envelope) -> Delivery {
        // ---
        let targets: Vec<(SubscriberId, Sender)> = {
            let registry = self.inner.registry.read();
            registry
                .by_site
                .values()
                .flat_map(|subs| subs.iter().map(|(id, tx)| (*id, tx.clone())))
                .collect()
        };
        self.deliver(targets, envelope)
    }

    fn deliver(&self, targets: Vec<(SubscriberId, Sender)>, envelope: Envelope) -> Delivery {
        // ---
        let envelope = Arc::new(envelope);
        let mut delivery = Delivery::default();
        let mut failed = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, kind = ?envelope.kind, "subscriber queue full, disconnecting");
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "subscriber gone");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut registry = self.inner.registry.write();
            for id in &failed {
                if registry.remove(*id) {
                    delivery.dropped += 1;
                }
            }
        }

        self.inner
            .delivered
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.inner
            .dropped
            .fetch_add(delivery.dropped as u64, Ordering::Relaxed);
        delivery
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.read().site_of.len()
    }

    pub fn subscribers_of(&self, site_id: SiteId) -> usize {
        self.inner
            .registry
            .read()
            .by_site
            .get(&site_id)
            .map_or(0, HashMap::len)
    }

    pub fn stats(&self) -> PushStats {
        // ---
        let registry = self.inner.registry.read();
        PushStats {
            subscribers: registry.site_of.len(),
            sites: registry.by_site.len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one live subscription.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Envelope>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next envelope, `None` once the hub removed this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_site_isolation_and_broadcast() {
        // ---
        let hub = PushHub::new(8);
        let mut a = hub.subscribe(1);
        let mut b = hub.subscribe(2);

        let delivery = hub.publish(2, Envelope::system("for site B", Some(2)));
        assert_eq!(delivery.delivered, 1);
        assert!(a.try_recv().is_none(), "site A must not see site B events");
        assert_eq!(b.try_recv().unwrap().payload["message"], "for site B");

        let delivery = hub.broadcast(Envelope::system("report ready", None));
        assert_eq!(delivery.delivered, 2);
        assert_eq!(a.try_recv().unwrap().kind, EventKind::System);
        assert!(b.try_recv().unwrap().site_id.is_none());
    }

    #[test]
    fn test_dropping_subscription_deregisters() {
        // ---
        let hub = PushHub::new(8);
        let sub = hub.subscribe(7);
        let id = sub.id();
        assert_eq!(hub.subscribers_of(7), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.stats().sites, 0);
        assert!(!hub.unsubscribe(id), "unsubscribe is idempotent");
    }

    #[test]
    fn test_full_subscriber_is_removed_without_blocking_others() {
        // ---
        let hub = PushHub::new(1);
        let _slow = hub.subscribe(3);
        let mut fast = hub.subscribe(3);

        let first = hub.publish(3, Envelope::system("one", Some(3)));
        assert_eq!(first.delivered, 2);
        assert!(fast.try_recv().is_some());

        // The slow subscriber never drained its single slot
        let second = hub.publish(3, Envelope::system("two", Some(3)));
        assert_eq!(second, Delivery { delivered: 1, dropped: 1 });
        assert_eq!(hub.subscribers_of(3), 1);
        assert_eq!(fast.try_recv().unwrap().payload["message"], "two");
    }

    #[test]
    fn test_closed_receiver_is_removed() {
        // ---
        let hub = PushHub::new(4);
        let (tx, rx) = mpsc::channel(4);
        hub.register(9, tx);
        drop(rx);

        let delivery = hub.publish(9, Envelope::system("anyone?", Some(9)));
        assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_envelope_wire_format() {
        // ---
        let envelope = Envelope::system("hello", None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "SYSTEM");
        assert!(json["site_id"].is_null());
        assert_eq!(json["payload"]["message"], "hello");
    }
}
