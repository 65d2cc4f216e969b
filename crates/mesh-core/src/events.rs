//! Typed pub/sub for endpoint and peer lifecycle events (spec §4.8).
//!
//! Publishers enqueue; subscribers drain on [`EventPublisher::dispatch`].
//! `dispatch` must be called from a controlled context — never from inside
//! a subscriber's own handler, which would re-enter the queue lock.

use crate::identifier::Identifier;
use codec::address::{Address, Protocol};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Why a listener binding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingFailureCause {
    Canceled,
    AddressInUse,
    Offline,
    Unreachable,
    Permissions,
    UnexpectedError,
}

/// Why an outbound connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureCause {
    InProgress,
    Reflective,
    Duplicate,
    Timeout,
    RetriesExhausted,
    UnexpectedError,
}

/// Why a registered endpoint was detached from a proxy (spec §4.3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalCause {
    DisconnectRequest,
    SessionClosure,
    NetworkShutdown,
    UnexpectedError,
}

/// The fixed catalogue of events this node advertises (spec §4.8). Each
/// variant's payload is its schema; there is no generic/open-ended event.
#[derive(Debug, Clone)]
pub enum Event {
    EndpointStarted {
        address: Address,
    },
    EndpointStopped {
        address: Address,
    },
    BindingFailed {
        address: Address,
        cause: BindingFailureCause,
    },
    ConnectionFailed {
        address: Address,
        cause: ConnectionFailureCause,
    },
    PeerConnected {
        identifier: Identifier,
        protocol: Protocol,
    },
    PeerDisconnected {
        identifier: Identifier,
        cause: WithdrawalCause,
    },
    CriticalNetworkFailure,
    RuntimeStarted,
    RuntimeStopped,
}

impl Event {
    /// The schema name, stable across releases, used for subscriber
    /// filtering and test assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::EndpointStarted { .. } => "EndpointStarted",
            Event::EndpointStopped { .. } => "EndpointStopped",
            Event::BindingFailed { .. } => "BindingFailed",
            Event::ConnectionFailed { .. } => "ConnectionFailed",
            Event::PeerConnected { .. } => "PeerConnected",
            Event::PeerDisconnected { .. } => "PeerDisconnected",
            Event::CriticalNetworkFailure => "CriticalNetworkFailure",
            Event::RuntimeStarted => "RuntimeStarted",
            Event::RuntimeStopped => "RuntimeStopped",
        }
    }
}

/// A subscriber is anything that can be handed a batch of drained events.
pub trait Subscriber: Send + Sync {
    fn on_events(&self, events: &[Event]);
}

struct Listener {
    subscriber: Arc<dyn Subscriber>,
}

/// Lightweight event bus: `publish` is lock-and-push, `dispatch` drains the
/// queue and fans it out to every subscriber in subscription order.
pub struct EventPublisher {
    queue: Mutex<VecDeque<Event>>,
    listeners: Mutex<Vec<Listener>>,
    suspended: AtomicBool,
    advertised: AtomicUsize,
}

/// The advertised event catalogue's size — fixed, used by
/// [`EventPublisher::advertisement_count`] for test assertions.
const ADVERTISED_KINDS: usize = 9;

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            advertised: AtomicUsize::new(ADVERTISED_KINDS),
        }
    }

    /// Registers a subscriber. Returns `false` (and does not subscribe) if
    /// subscriptions have been suspended via [`Self::suspend`].
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        if self.suspended.load(Ordering::Acquire) {
            return false;
        }
        self.listeners.lock().push(Listener { subscriber });
        true
    }

    /// Closes the publisher to new subscribers. Existing subscribers keep
    /// receiving events.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn publish(&self, event: Event) {
        self.queue.lock().push_back(event);
    }

    /// Drains the queue and fans every event out to every subscriber, in
    /// subscription order. Must be called from outside any subscriber's
    /// `on_events` — re-entering here would deadlock on `queue`.
    pub fn dispatch(&self) -> usize {
        let drained: Vec<Event> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener.subscriber.on_events(&drained);
        }
        drained.len()
    }

    pub fn advertisement_count(&self) -> usize {
        self.advertised.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    struct Counting(Arc<Counter>);

    impl Subscriber for Counting {
        fn on_events(&self, events: &[Event]) {
            self.0.fetch_add(events.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_drains_and_fans_out() {
        let publisher = EventPublisher::new();
        let count = Arc::new(Counter::new(0));
        publisher.subscribe(Arc::new(Counting(count.clone())));

        publisher.publish(Event::RuntimeStarted);
        publisher.publish(Event::RuntimeStopped);
        assert_eq!(publisher.pending_count(), 2);

        let dispatched = publisher.dispatch();
        assert_eq!(dispatched, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.pending_count(), 0);
    }

    #[test]
    fn suspend_rejects_new_subscribers() {
        let publisher = EventPublisher::new();
        publisher.suspend();
        let count = Arc::new(Counter::new(0));
        assert!(!publisher.subscribe(Arc::new(Counting(count))));
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn advertisement_count_matches_fixed_catalogue() {
        let publisher = EventPublisher::new();
        assert_eq!(publisher.advertisement_count(), ADVERTISED_KINDS);
    }
}
