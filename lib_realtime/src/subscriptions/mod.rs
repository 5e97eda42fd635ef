//! # Subscription Registry and Fan-out
//!
//! Maps widget keys to live subscribers and delivers published payloads to
//! each of them under per-subscriber throttling and filtering.
//!
//! ## Delivery semantics
//!
//! - Subscribers are notified in registration order within one `publish`.
//! - The handle list is snapshotted under the lock and delivery happens
//!   outside it (copy-on-publish), so concurrent subscribe/unsubscribe can
//!   never corrupt iteration. A subscription removed after the snapshot was
//!   taken may still receive that one in-flight notification, and no
//!   further ones.
//! - A throttled update is dropped for that subscriber, not queued or
//!   batched. No buffering, no backpressure from slow subscribers.
//! - A callback failure is logged, emitted as an error event, and never
//!   stops delivery to the remaining subscribers.
//!
//! Storage is arena-style: a flat table keyed by generated id plus an
//! explicit widget-key index maintained on insert/remove.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::core::events::{emit, EngineEvent, EventSender};
use crate::core::payload::WidgetPayload;

/// Invoked once per delivered update. An `Err` is contained to this
/// subscriber and surfaced as a `SubscriberCallbackError` event.
pub type DeliveryCallback = Arc<dyn Fn(&WidgetPayload) -> Result<(), String> + Send + Sync>;

/// Optional predicate over the published payload; `false` skips delivery.
pub type PayloadFilter = Arc<dyn Fn(&WidgetPayload) -> bool + Send + Sync>;

/// Per-subscription delivery options.
#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<PayloadFilter>,
    /// Minimum interval between two deliveries to this subscriber.
    pub throttle: Option<Duration>,
}

#[derive(Clone)]
struct SubscriptionHandle {
    id: Uuid,
    subscriber_id: String,
    widget_key: String,
    callback: DeliveryCallback,
    filter: Option<PayloadFilter>,
    throttle: Duration,
    /// Mutable delivery state shared with in-flight publish snapshots.
    last_delivered_at: Arc<Mutex<Option<Instant>>>,
}

#[derive(Default)]
struct RegistryInner {
    /// Arena: all live subscriptions by id.
    subs: HashMap<Uuid, SubscriptionHandle>,
    /// Secondary index: widget key -> subscription ids in registration order.
    by_widget: HashMap<String, Vec<Uuid>>,
}

pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    delivered: AtomicU64,
    events: EventSender,
}

impl SubscriptionRegistry {
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            delivered: AtomicU64::new(0),
            events,
        }
    }

    /// Registers a subscriber for a widget key and returns the subscription id.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        widget_key: &str,
        callback: DeliveryCallback,
        opts: SubscribeOptions,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let handle = SubscriptionHandle {
            id,
            subscriber_id: subscriber_id.to_string(),
            widget_key: widget_key.to_string(),
            callback,
            filter: opts.filter,
            throttle: opts.throttle.unwrap_or(Duration::ZERO),
            last_delivered_at: Arc::new(Mutex::new(None)),
        };
        let mut inner = self.inner.lock().expect("Subscription registry lock poisoned");
        inner.subs.insert(id, handle);
        inner
            .by_widget
            .entry(widget_key.to_string())
            .or_default()
            .push(id);
        log::info!(
            "Subscriber '{}' registered on '{}' as {}",
            subscriber_id,
            widget_key,
            id
        );
        id
    }

    /// Removes a subscription. Unknown ids are a no-op. Empty index buckets
    /// are dropped so the registry shrinks with its subscribers.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("Subscription registry lock poisoned");
        if let Some(handle) = inner.subs.remove(&id) {
            if let Some(ids) = inner.by_widget.get_mut(&handle.widget_key) {
                ids.retain(|existing| *existing != id);
                if ids.is_empty() {
                    inner.by_widget.remove(&handle.widget_key);
                }
            }
            log::info!(
                "Subscriber '{}' removed from '{}'",
                handle.subscriber_id,
                handle.widget_key
            );
        }
    }

    /// Fans a payload out to every subscription on the widget key. Returns
    /// the number of successful deliveries.
    pub fn publish(&self, widget_key: &str, payload: &WidgetPayload) -> usize {
        let snapshot: Vec<SubscriptionHandle> = {
            let inner = self.inner.lock().expect("Subscription registry lock poisoned");
            match inner.by_widget.get(widget_key) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| inner.subs.get(id).cloned())
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for sub in snapshot {
            if let Some(filter) = &sub.filter {
                if !filter(payload) {
                    continue;
                }
            }
            {
                let mut last = sub
                    .last_delivered_at
                    .lock()
                    .expect("Subscription delivery state lock poisoned");
                if let Some(previous) = *last {
                    if previous.elapsed() < sub.throttle {
                        // Throttled updates are dropped, not queued.
                        continue;
                    }
                }
                *last = Some(Instant::now());
            }
            if let Err(reason) = (sub.callback)(payload) {
                log::warn!(
                    "Subscriber '{}' callback failed on '{}': {}",
                    sub.subscriber_id,
                    widget_key,
                    reason
                );
                emit(
                    &self.events,
                    EngineEvent::SubscriberCallbackError {
                        subscription_id: sub.id,
                        widget_key: widget_key.to_string(),
                        reason,
                    },
                );
                continue;
            }
            delivered += 1;
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Number of live subscriptions across all widget keys.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("Subscription registry lock poisoned")
            .subs
            .len()
    }

    /// Total successful deliveries since construction.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Drops every subscription. Used on engine teardown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("Subscription registry lock poisoned");
        inner.subs.clear();
        inner.by_widget.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::event_channel;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> SubscriptionRegistry {
        let (events, _rx) = event_channel(16);
        SubscriptionRegistry::new(events)
    }

    fn counting_callback() -> (DeliveryCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let cb: DeliveryCallback = Arc::new(move |_payload| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (cb, count)
    }

    fn payload(status: &str) -> WidgetPayload {
        WidgetPayload::new(json!({ "status": status }))
    }

    #[test]
    fn publish_reaches_every_subscriber_once() {
        let reg = registry();
        let (cb_a, count_a) = counting_callback();
        let (cb_b, count_b) = counting_callback();
        reg.subscribe("u1", "w1", cb_a, SubscribeOptions::default());
        reg.subscribe("u2", "w1", cb_b, SubscribeOptions::default());

        assert_eq!(reg.publish("w1", &payload("ok")), 2);
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(reg.delivered(), 2);
    }

    #[test]
    fn unsubscribed_callback_is_never_invoked() {
        let reg = registry();
        let (cb, count) = counting_callback();
        let id = reg.subscribe("u1", "w1", cb, SubscribeOptions::default());
        reg.unsubscribe(id);
        reg.publish("w1", &payload("ok"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(reg.subscriber_count(), 0);
    }

    #[test]
    fn filter_excludes_non_matching_payloads() {
        let reg = registry();
        let (cb, count) = counting_callback();
        let filter: PayloadFilter = Arc::new(|p| p.data["status"] == "critical");
        reg.subscribe(
            "u1",
            "w1",
            cb,
            SubscribeOptions {
                filter: Some(filter),
                throttle: None,
            },
        );

        reg.publish("w1", &payload("normal"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        reg.publish("w1", &payload("critical"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throttle_drops_rapid_updates() {
        let reg = registry();
        let (cb, count) = counting_callback();
        reg.subscribe(
            "u1",
            "w1",
            cb,
            SubscribeOptions {
                filter: None,
                throttle: Some(Duration::from_millis(1000)),
            },
        );

        reg.publish("w1", &payload("a"));
        // Well inside the throttle window: dropped, not queued.
        reg.publish("w1", &payload("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_failure_does_not_stop_delivery() {
        let (events, mut rx) = event_channel(16);
        let reg = SubscriptionRegistry::new(events);
        let failing: DeliveryCallback = Arc::new(|_| Err("subscriber exploded".to_string()));
        let (ok_cb, ok_count) = counting_callback();
        reg.subscribe("bad", "w1", failing, SubscribeOptions::default());
        reg.subscribe("good", "w1", ok_cb, SubscribeOptions::default());

        let delivered = reg.publish("w1", &payload("ok"));
        assert_eq!(delivered, 1);
        assert_eq!(ok_count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::SubscriberCallbackError { .. })
        ));
    }

    #[test]
    fn delivery_follows_registration_order() {
        let reg = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let cb: DeliveryCallback = Arc::new(move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
            reg.subscribe(name, "w1", cb, SubscribeOptions::default());
        }
        reg.publish("w1", &payload("ok"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
