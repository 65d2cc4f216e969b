//! Peer manager and resolution service (spec §4.4).
//!
//! The manager is a two-index container of [`Proxy`] aggregates, keyed by
//! both internal and external identifier form (the external form is a
//! pure function of the internal bytes, so only one map is kept). The
//! resolution service sits in front of it: a connect delegate dials out
//! knowing only an address (the peer's identifier may or may not be
//! configured up front), so resolvers are staged address-keyed until
//! `link_peer` promotes them once the peer's identity is known.

use crate::events::{BindingFailureCause, Event, EventPublisher, WithdrawalCause};
use crate::exchange::ConnectProtocol;
use crate::identifier::Identifier;
use crate::proxy::{Proxy, ResolutionObserver};
use codec::address::{Address, Protocol};
use codec::message::PlatformParcel;
use crypto::kem::Role;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

/// Filters over the manager's current proxy set (spec §4.4 "filters").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    /// Has at least one registered endpoint.
    Active,
    /// Has none.
    Inactive,
    /// Every proxy currently tracked by the manager, active or not —
    /// distinct from `Resolving`, which is a pre-proxy, address-only
    /// state some peers never pass through (see `declare_resolving_peer`).
    Observed,
    /// Has a resolver attached (handshake in progress).
    Resolving,
}

struct Index {
    by_internal: ahash::HashMap<[u8; crate::identifier::LEN], Arc<Proxy>>,
}

/// Two-index container of proxies plus lifecycle fan-out (spec §4.4,
/// §4.8).
pub struct PeerManager {
    self_ref: Weak<PeerManager>,
    local_identifier: Identifier,
    index: parking_lot::RwLock<Index>,
    resolving: parking_lot::Mutex<ahash::HashMap<Address, Arc<Proxy>>>,
    events: Arc<EventPublisher>,
    critical_failure_raised: AtomicBool,
}

impl PeerManager {
    pub fn new(local_identifier: Identifier, events: Arc<EventPublisher>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            local_identifier,
            index: parking_lot::RwLock::new(Index {
                by_internal: ahash::HashMap::default(),
            }),
            resolving: parking_lot::Mutex::new(ahash::HashMap::default()),
            events,
            critical_failure_raised: AtomicBool::new(false),
        })
    }

    /// Spec §7's sole escalation path for `BindingFailure`: any cause other
    /// than `Canceled` (an intentional shutdown) bubbles to a process-level
    /// `CriticalNetworkFailure`, raised at most once regardless of how many
    /// endpoints report it.
    pub fn on_binding_failure(&self, cause: BindingFailureCause) {
        if cause == BindingFailureCause::Canceled {
            return;
        }
        if !self.critical_failure_raised.swap(true, Ordering::AcqRel) {
            self.events.publish(Event::CriticalNetworkFailure);
        }
    }

    pub fn get(&self, identifier: Identifier) -> Option<Arc<Proxy>> {
        self.index.read().by_internal.get(identifier.internal()).cloned()
    }

    pub fn get_external(&self, external: &str) -> Option<Arc<Proxy>> {
        let identifier = Identifier::parse_external(external)?;
        self.get(identifier)
    }

    pub fn contains(&self, identifier: Identifier) -> bool {
        self.index.read().by_internal.contains_key(identifier.internal())
    }

    pub fn len(&self) -> usize {
        self.index.read().by_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filtered iteration over the live proxy set (spec §4.4 "filters").
    pub fn filter(&self, filter: PeerFilter) -> Vec<Arc<Proxy>> {
        self.index
            .read()
            .by_internal
            .values()
            .filter(|proxy| match filter {
                PeerFilter::Active => proxy.is_active(),
                PeerFilter::Inactive => !proxy.is_active(),
                PeerFilter::Observed => true,
                PeerFilter::Resolving => proxy.has_resolver(),
            })
            .cloned()
            .collect()
    }

    /// Step (a) of a connect delegate (spec §4.2/§4.4): declares `address`
    /// as resolving and stages an Initiator-role exchange processor.
    /// `identifier`, when the peer's identity is configured up front,
    /// indexes the proxy immediately so `get`/`contains` see it before
    /// the handshake completes; otherwise the proxy sits under
    /// `Identifier::INVALID` until `link_peer` relabels it.
    ///
    /// Returns `None` if `address` is already resolving — the caller
    /// (another connect delegate racing for the same peer) must treat
    /// this as `InProgress` and exit, per spec §4.2.
    pub fn declare_resolving_peer(
        &self,
        address: Address,
        identifier: Option<Identifier>,
        connect_protocol: Option<Arc<dyn ConnectProtocol>>,
    ) -> Result<Option<(Arc<Proxy>, Option<PlatformParcel>)>, crate::error::Error> {
        let mut resolving = self.resolving.lock();
        if resolving.contains_key(&address) {
            return Ok(None);
        }

        if let Some(id) = identifier {
            if self.index.read().by_internal.contains_key(id.internal()) {
                return Err(crate::error::Error::PeerAlreadyExists);
            }
        }

        let proxy = Proxy::new(self.local_identifier, identifier.unwrap_or(Identifier::INVALID));
        proxy.set_resolution_observer(self.self_ref.clone() as Weak<dyn ResolutionObserver>);
        let (_, first) = proxy.start_exchange(Role::Initiator, connect_protocol);

        resolving.insert(address, proxy.clone());
        if let Some(id) = identifier {
            self.index.write().by_internal.insert(*id.internal(), proxy.clone());
        }

        Ok(Some((proxy, first)))
    }

    /// Accept/connect-path promotion (spec §4.4): called once the peer's
    /// identifier is known — either because the handshake's first frame
    /// carried it (accept path) or because the address finishes a
    /// previously address-only resolve. Creates a fresh Acceptor-role
    /// proxy if none was staged for `address`.
    pub fn link_peer(&self, address: &Address, identifier: Identifier) -> Result<Arc<Proxy>, crate::error::Error> {
        if let Some(proxy) = self.resolving.lock().remove(address) {
            if proxy.identifier() == Identifier::INVALID {
                proxy.relabel(identifier);
            } else if proxy.identifier() != identifier {
                return Err(crate::error::Error::MisaddressedHandshake);
            }

            let mut index = self.index.write();
            if let Some(existing) = index.by_internal.get(identifier.internal()) {
                if !Arc::ptr_eq(existing, &proxy) {
                    return Ok(existing.clone());
                }
            } else {
                index.by_internal.insert(*identifier.internal(), proxy.clone());
            }
            return Ok(proxy);
        }

        if let Some(proxy) = self.get(identifier) {
            if !proxy.has_resolver() {
                proxy.start_exchange(Role::Acceptor, None);
            }
            return Ok(proxy);
        }

        let proxy = Proxy::new(self.local_identifier, identifier);
        proxy.set_resolution_observer(self.self_ref.clone() as Weak<dyn ResolutionObserver>);
        proxy.start_exchange(Role::Acceptor, None);
        self.index.write().by_internal.insert(*identifier.internal(), proxy.clone());
        Ok(proxy)
    }

    /// Withdraws an address from the resolving set without promoting it
    /// (handshake abandoned before the peer identifier was learned).
    pub fn rescind_resolving_peer(&self, address: &Address) -> Option<Arc<Proxy>> {
        let proxy = self.resolving.lock().remove(address)?;
        proxy.schedule_disconnect();
        Some(proxy)
    }

    /// Removes a peer entirely (all endpoints withdrawn, proxy retired).
    pub fn remove(&self, identifier: Identifier) -> Option<Arc<Proxy>> {
        self.index.write().by_internal.remove(identifier.internal())
    }

    /// Fan-out for a newly registered endpoint: publishes `PeerConnected`.
    /// Invoked under the publisher's queue lock only — never re-entrantly
    /// from a subscriber's own handler (spec §4.8).
    pub fn on_endpoint_registered(&self, identifier: Identifier, protocol: Protocol) {
        self.events.publish(Event::PeerConnected { identifier, protocol });
    }

    /// Fan-out for an endpoint withdrawal. Publishes `PeerDisconnected`
    /// and, if the proxy has gone fully inactive, removes it from the
    /// index.
    pub fn on_endpoint_withdrawn(&self, identifier: Identifier, cause: WithdrawalCause) {
        self.events.publish(Event::PeerDisconnected { identifier, cause });
        if let Some(proxy) = self.get(identifier) {
            if !proxy.is_active() {
                self.remove(identifier);
            }
        }
    }
}

/// Lets a proxy notify this manager directly on register/withdraw (spec
/// §4.6), without holding a strong reference back to it.
impl ResolutionObserver for PeerManager {
    fn on_endpoint_registered(&self, identifier: Identifier, protocol: Protocol) {
        self.on_endpoint_registered(identifier, protocol);
    }

    fn on_endpoint_withdrawn(&self, identifier: Identifier, cause: WithdrawalCause) {
        self.on_endpoint_withdrawn(identifier, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; crate::identifier::LEN])
    }

    fn manager() -> Arc<PeerManager> {
        PeerManager::new(identifier(0), Arc::new(EventPublisher::new()))
    }

    #[test]
    fn declare_peer_with_known_identifier_indexes_immediately() {
        let manager = manager();
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let (proxy, first) = manager
            .declare_resolving_peer(address, Some(identifier(7)), None)
            .unwrap()
            .unwrap();
        assert!(first.is_some());
        assert_eq!(proxy.identifier(), identifier(7));
        assert!(manager.contains(identifier(7)));
        assert_eq!(manager.filter(PeerFilter::Resolving).len(), 1);
    }

    #[test]
    fn declare_peer_rejects_duplicate_identifier() {
        let manager = manager();
        let a = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let b = Address::parse(Protocol::Tcp, "127.0.0.1:2").unwrap();
        manager.declare_resolving_peer(a, Some(identifier(7)), None).unwrap();
        assert!(matches!(
            manager.declare_resolving_peer(b, Some(identifier(7)), None),
            Err(crate::error::Error::PeerAlreadyExists)
        ));
    }

    #[test]
    fn declare_resolving_peer_in_progress_returns_none() {
        let manager = manager();
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:3").unwrap();
        assert!(manager.declare_resolving_peer(address.clone(), None, None).unwrap().is_some());
        assert!(manager.declare_resolving_peer(address, None, None).unwrap().is_none());
    }

    #[test]
    fn link_peer_promotes_address_only_resolve() {
        let manager = manager();
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:4").unwrap();
        manager.declare_resolving_peer(address.clone(), None, None).unwrap();

        let linked = manager.link_peer(&address, identifier(9)).unwrap();
        assert_eq!(linked.identifier(), identifier(9));
        assert!(manager.contains(identifier(9)));
    }

    #[test]
    fn link_peer_creates_fresh_proxy_for_pure_accept() {
        let manager = manager();
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:5").unwrap();
        let proxy = manager.link_peer(&address, identifier(11)).unwrap();
        assert_eq!(proxy.identifier(), identifier(11));
        assert!(proxy.has_resolver());
    }

    #[test]
    fn binding_failure_raises_critical_network_failure_once() {
        let events = Arc::new(EventPublisher::new());
        let manager = PeerManager::new(identifier(0), events.clone());

        manager.on_binding_failure(BindingFailureCause::AddressInUse);
        manager.on_binding_failure(BindingFailureCause::AddressInUse);
        assert_eq!(events.pending_count(), 1);
    }

    #[test]
    fn canceled_binding_failure_does_not_raise_critical_failure() {
        let events = Arc::new(EventPublisher::new());
        let manager = PeerManager::new(identifier(0), events.clone());

        manager.on_binding_failure(BindingFailureCause::Canceled);
        assert_eq!(events.pending_count(), 0);
    }
}
