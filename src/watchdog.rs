//! Gateway availability watchdog.
//!
//! Heartbeats (`gateway_alive`, plus any report a gateway relays) refresh a
//! per-gateway timestamp. A periodic tick, independent of traffic, judges
//! each gateway that has ever been heard from and publishes its current
//! verdict on [`EventBus::availability`]. Registries only notify devices
//! whose availability actually flips, so devices that appeared after the
//! gateway went quiet still pick up the verdict on the next tick.
//! Gateways never heard from are not judged.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, GatewayAvailability, Subscription};
use crate::protocol::normalize_mac;

pub struct Watchdog {
    timeout: Duration,
    last_heartbeat: HashMap<String, Instant>,
    /// Last published verdict; devices start out available.
    available: HashMap<String, bool>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heartbeat: HashMap::new(),
            available: HashMap::new(),
        }
    }

    pub fn record_heartbeat(&mut self, mac: &str, now: Instant) {
        self.last_heartbeat.insert(normalize_mac(mac), now);
    }

    pub fn last_heartbeat(&self, mac: &str) -> Option<Instant> {
        self.last_heartbeat.get(&normalize_mac(mac)).copied()
    }

    /// Judge every known gateway at `now`; returns only changed verdicts.
    pub fn evaluate(&mut self, now: Instant) -> Vec<GatewayAvailability> {
        let mut changed = Vec::new();
        for (mac, last) in &self.last_heartbeat {
            let available = now.saturating_duration_since(*last) <= self.timeout;
            let previous = self.available.insert(mac.clone(), available).unwrap_or(true);
            if previous != available {
                changed.push(GatewayAvailability {
                    mac: mac.clone(),
                    available,
                });
            }
        }
        changed.sort_by(|a, b| a.mac.cmp(&b.mac));
        changed
    }

    /// Latest verdict for every judged gateway, ordered by MAC.
    pub fn verdicts(&self) -> Vec<GatewayAvailability> {
        let mut verdicts: Vec<GatewayAvailability> = self
            .available
            .iter()
            .map(|(mac, available)| GatewayAvailability {
                mac: mac.clone(),
                available: *available,
            })
            .collect();
        verdicts.sort_by(|a, b| a.mac.cmp(&b.mac));
        verdicts
    }
}

/// The running watchdog: heartbeat subscription plus the tick task.
pub struct WatchdogHandle {
    state: Arc<Mutex<Watchdog>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    _heartbeats: Subscription,
}

impl WatchdogHandle {
    pub fn start(bus: EventBus, timeout: Duration, tick: Duration) -> Self {
        let state = Arc::new(Mutex::new(Watchdog::new(timeout)));
        let cancel = CancellationToken::new();

        let heartbeats = {
            let state = state.clone();
            bus.gateway_alive.subscribe(move |alive| {
                state.lock().record_heartbeat(&alive.mac, Instant::now());
            })
        };

        let handle = tokio::spawn(run_ticks(state.clone(), bus, tick, cancel.clone()));
        log::info!(
            "Availability watchdog started (timeout={}s, tick={}s)",
            timeout.as_secs(),
            tick.as_secs()
        );

        Self {
            state,
            cancel,
            handle: Some(handle),
            _heartbeats: heartbeats,
        }
    }

    pub fn record_heartbeat(&self, mac: &str) {
        self.state.lock().record_heartbeat(mac, Instant::now());
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            log::info!("Availability watchdog stopped");
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_ticks(
    state: Arc<Mutex<Watchdog>>,
    bus: EventBus,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let verdicts = {
                    let mut dog = state.lock();
                    for changed in dog.evaluate(Instant::now()) {
                        if changed.available {
                            log::info!("Gateway {} is alive again", changed.mac);
                        } else {
                            log::warn!("Gateway {} missed its heartbeat", changed.mac);
                        }
                    }
                    dog.verdicts()
                };
                for verdict in &verdicts {
                    bus.availability.publish(verdict);
                }
            }
        }
    }
}
