//! Logs and counts the fixed event catalogue a node publishes (spec §4.8).

use std::sync::Arc;

use mesh_core::events::{Event, Subscriber};

use crate::statistics::{Stat, Statistics};

#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl Subscriber for Observer {
    fn on_events(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::EndpointStarted { address } => {
                    log::info!("endpoint started: {address}");
                }
                Event::EndpointStopped { address } => {
                    log::info!("endpoint stopped: {address}");
                }
                Event::BindingFailed { address, cause } => {
                    log::error!("binding failed: address={address}, cause={cause:?}");
                }
                Event::ConnectionFailed { address, cause } => {
                    log::warn!("connect failed: address={address}, cause={cause:?}");
                }
                Event::PeerConnected { identifier, protocol } => {
                    log::info!("peer connected: identifier={identifier}, protocol={protocol}");
                    self.statistics.register(*identifier);
                }
                Event::PeerDisconnected { identifier, cause } => {
                    log::info!("peer disconnected: identifier={identifier}, cause={cause:?}");
                    self.statistics.unregister(identifier);
                }
                Event::CriticalNetworkFailure => {
                    log::error!("critical network failure");
                }
                Event::RuntimeStarted => {
                    log::info!("runtime started");
                }
                Event::RuntimeStopped => {
                    log::info!("runtime stopped");
                }
            }
        }
    }
}

/// Drives [`Subscriber::on_events`] for every registered publisher once per
/// scheduler tick (spec §4.8's publisher is lock-and-push; dispatch has to
/// happen from a controlled context outside any subscriber's own handler).
pub struct DispatchDelegate {
    events: Arc<mesh_core::events::EventPublisher>,
}

impl DispatchDelegate {
    pub fn new(events: Arc<mesh_core::events::EventPublisher>) -> Self {
        Self { events }
    }
}

impl mesh_core::scheduler::Delegate for DispatchDelegate {
    fn name(&self) -> &str {
        "event-dispatch"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn execute(&self) {
        self.events.dispatch();
    }
}
