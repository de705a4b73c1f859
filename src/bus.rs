//! Same-process publish/subscribe.
//!
//! One [`Channel`] per event category. Delivery is synchronous and in
//! subscription order: `publish` returns after every subscriber has run.
//! Subscribers are removed by dropping (or calling `unsubscribe` on) the
//! [`Subscription`] they were handed.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;

use crate::protocol::{
    DeviceJoin, DeviceKind, DeviceReport, GatewayAlive, InboundMessage, JoinWindow, Registration,
    StateUpdate, ZigbeeReport,
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ChannelInner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
}

pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));

        let weak: Weak<ChannelInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Deliver `event` to every current subscriber; returns how many ran.
    ///
    /// The subscriber list is snapshotted first so a callback may subscribe,
    /// unsubscribe or publish on the same channel without deadlocking.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Handle returned by [`Channel::subscribe`]; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.remove_now();
    }

    fn remove_now(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove_now();
    }
}

/// Availability verdict produced by the watchdog for one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAvailability {
    pub mac: String,
    pub available: bool,
}

/// The named event channels decoded gateway traffic is published on.
#[derive(Clone, Default)]
pub struct EventBus {
    pub light_register: Channel<Registration>,
    pub light_state: Channel<StateUpdate>,
    pub cover_register: Channel<Registration>,
    pub cover_state: Channel<StateUpdate>,
    pub device_join: Channel<DeviceJoin>,
    pub device_report: Channel<DeviceReport>,
    pub zigbee_report: Channel<ZigbeeReport>,
    pub gateway_alive: Channel<GatewayAlive>,
    pub join_window: Channel<JoinWindow>,
    pub availability: Channel<GatewayAvailability>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a decoded message to its channel. Returns `false` for
    /// unrecognized messages, which have no channel.
    pub fn dispatch(&self, message: &InboundMessage) -> bool {
        match message {
            InboundMessage::Register(reg) => match reg.kind {
                DeviceKind::Light => self.light_register.publish(reg),
                DeviceKind::Cover => self.cover_register.publish(reg),
            },
            InboundMessage::State(update) => match update.kind {
                DeviceKind::Light => self.light_state.publish(update),
                DeviceKind::Cover => self.cover_state.publish(update),
            },
            InboundMessage::DeviceJoin(join) => self.device_join.publish(join),
            InboundMessage::DeviceReport(report) => self.device_report.publish(report),
            InboundMessage::ZigbeeReport(report) => self.zigbee_report.publish(report),
            InboundMessage::GatewayAlive(alive) => self.gateway_alive.publish(alive),
            InboundMessage::JoinWindow(window) => self.join_window.publish(window),
            InboundMessage::Unrecognized(_) => return false,
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_in_subscription_order_until_dropped() {
        let channel: Channel<u32> = Channel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = seen.clone();
            channel.subscribe(move |v| seen.lock().push(("a", *v)))
        };
        let _s2 = {
            let seen = seen.clone();
            channel.subscribe(move |v| seen.lock().push(("b", *v)))
        };

        assert_eq!(channel.publish(&1), 2);
        drop(s1);
        assert_eq!(channel.publish(&2), 1);
        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("b", 2)]);
    }

    #[test]
    fn callback_may_publish_on_the_same_channel() {
        let channel: Channel<u32> = Channel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let channel = channel.clone();
            let count = count.clone();
            channel.clone().subscribe(move |v| {
                count.fetch_add(1, Ordering::SeqCst);
                if *v > 0 {
                    channel.publish(&(v - 1));
                }
            })
        };
        channel.publish(&2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dispatch_routes_by_kind() {
        let bus = EventBus::new();
        let covers = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let covers = covers.clone();
            bus.cover_register.subscribe(move |_| {
                covers.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(bus.dispatch(&InboundMessage::Register(Registration::new(
            DeviceKind::Cover,
            "c1"
        ))));
        assert!(bus.dispatch(&InboundMessage::Register(Registration::new(
            DeviceKind::Light,
            "l1"
        ))));
        assert!(!bus.dispatch(&InboundMessage::Unrecognized("x".into())));
        assert_eq!(covers.load(Ordering::SeqCst), 1);
    }
}
