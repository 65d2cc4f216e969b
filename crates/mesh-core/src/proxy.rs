//! Per-peer aggregate: registered endpoints, cipher package, enabled
//! receiver and authorization state (spec §4.6).

use crate::context::{MessageContext, MessageSink, ProxyHandle};
use crate::events::WithdrawalCause;
use crate::exchange::{ExchangeObserver, ExchangeProcessor, PlatformSink};
use crate::identifier::Identifier;
use crate::tracking::{ResponseSink, TrackerKey, TrackingService};
use codec::address::{Address, Protocol};
use codec::message::{ApplicationParcel, AwaitableBinding, Awaitable, PlatformParcel};
use crypto::cipher::CipherPackage;
use crypto::kem::Role;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Authorization lifecycle for a proxy (spec §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Unauthorized,
    Flagged,
    Authorized,
}

/// Callback surface the resolution service exposes so a proxy can notify
/// it of endpoint lifecycle changes (spec §4.6 register/withdraw "notifies
/// the resolution service") without holding a strong reference back to it.
pub trait ResolutionObserver: Send + Sync {
    fn on_endpoint_registered(&self, identifier: Identifier, protocol: Protocol);
    fn on_endpoint_withdrawn(&self, identifier: Identifier, cause: WithdrawalCause);
}

/// A message the dispatcher can be asked to send: either an owned buffer
/// (already framed) or a shared, pre-serialized pack reusable across
/// multiple sends (e.g. a broadcast).
#[derive(Clone)]
pub enum OutboundMessage {
    Owned(String),
    Shared(Arc<String>),
}

impl OutboundMessage {
    pub fn as_str(&self) -> &str {
        match self {
            OutboundMessage::Owned(s) => s,
            OutboundMessage::Shared(s) => s,
        }
    }
}

type SendAction = Box<dyn Fn(OutboundMessage) -> bool + Send + Sync>;
type DisconnectAction = Box<dyn Fn() + Send + Sync>;

/// A live binding between a peer and one of this node's endpoints.
struct Registration {
    protocol: Protocol,
    address: Address,
    send_action: SendAction,
    disconnect_action: DisconnectAction,
}

struct Inner {
    endpoints: parking_lot::Mutex<ahash::HashMap<u64, Registration>>,
    associated_addresses: parking_lot::Mutex<ahash::HashMap<Address, bool>>,
    receiver: parking_lot::Mutex<Option<Arc<dyn MessageSink>>>,
    resolver: parking_lot::Mutex<Option<Resolver>>,
    cipher: parking_lot::RwLock<Option<Arc<CipherPackage>>>,
    authorization: parking_lot::Mutex<Authorization>,
    resolution_observer: parking_lot::Mutex<Option<Weak<dyn ResolutionObserver>>>,
    sent: AtomicU64,
    received: AtomicU64,
}

/// Transient owner of an in-progress handshake on a proxy (spec
/// glossary: Resolver).
pub struct Resolver {
    pub exchange: Arc<ExchangeProcessor>,
}

/// Builds a parcel destined for a specific peer and stages it with the
/// tracking service before it is handed to [`Proxy::request`].
pub struct RequestBuilder {
    pub route: Vec<u8>,
    pub payload: Vec<u8>,
}

/// The per-peer aggregate described in spec §3/§4.6.
///
/// `local_identifier` is this node's own identity — shared across every
/// proxy, it never changes after construction. `identifier` is the
/// *peer's* identity: known up front when we dial out to a configured
/// peer, but `Identifier::INVALID` until the handshake's first parcel
/// reveals it when the peer address alone started the resolve (see
/// `manager::link_peer`, which relabels it).
pub struct Proxy {
    local_identifier: Identifier,
    identifier: parking_lot::Mutex<Identifier>,
    inner: Inner,
}

impl Proxy {
    pub fn new(local_identifier: Identifier, identifier: Identifier) -> Arc<Self> {
        Arc::new(Self {
            local_identifier,
            identifier: parking_lot::Mutex::new(identifier),
            inner: Inner {
                endpoints: parking_lot::Mutex::new(ahash::HashMap::default()),
                associated_addresses: parking_lot::Mutex::new(ahash::HashMap::default()),
                receiver: parking_lot::Mutex::new(None),
                resolver: parking_lot::Mutex::new(None),
                cipher: parking_lot::RwLock::new(None),
                authorization: parking_lot::Mutex::new(Authorization::Unauthorized),
                resolution_observer: parking_lot::Mutex::new(None),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
            },
        })
    }

    pub fn identifier(&self) -> Identifier {
        *self.identifier.lock()
    }

    pub fn local_identifier(&self) -> Identifier {
        self.local_identifier
    }

    /// Assigns the peer identity once the handshake reveals it. Only
    /// meaningful while the current identity is `Identifier::INVALID`;
    /// called exclusively by `manager::link_peer`.
    pub(crate) fn relabel(&self, identifier: Identifier) {
        *self.identifier.lock() = identifier;
    }

    pub fn authorization(&self) -> Authorization {
        *self.inner.authorization.lock()
    }

    pub fn cipher(&self) -> Option<Arc<CipherPackage>> {
        self.inner.cipher.read().clone()
    }

    pub fn has_resolver(&self) -> bool {
        self.inner.resolver.lock().is_some()
    }

    /// Installs the resolution service to notify on endpoint register/
    /// withdraw. Called once by `manager::PeerManager` right after the
    /// proxy is created.
    pub fn set_resolution_observer(&self, observer: Weak<dyn ResolutionObserver>) {
        *self.inner.resolution_observer.lock() = Some(observer);
    }

    pub fn is_active(&self) -> bool {
        !self.inner.endpoints.lock().is_empty()
    }

    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    /// Increments the received counter and hands `buffer` to whichever
    /// receiver is currently enabled. Fails if the endpoint is unknown or
    /// no receiver is installed.
    pub fn schedule_receive(self: &Arc<Self>, endpoint_id: u64, buffer: &[u8]) -> Result<bool, crate::error::Error> {
        let protocol = self
            .inner
            .endpoints
            .lock()
            .get(&endpoint_id)
            .map(|registration| registration.protocol)
            .ok_or(crate::error::Error::UnknownEndpoint(endpoint_id))?;

        self.inner.received.fetch_add(1, Ordering::Relaxed);

        let receiver = self.inner.receiver.lock().clone();
        let receiver = receiver.ok_or(crate::error::Error::NoReceiver)?;

        let handle: Weak<dyn ProxyHandle> = Arc::downgrade(self) as Weak<dyn ProxyHandle>;
        let context = MessageContext::new(endpoint_id, protocol, handle);
        Ok(receiver.collect_message(&context, buffer))
    }

    /// Invokes the named endpoint's send action. Fails if the endpoint is
    /// unregistered; the caller treats a dropped send (inactive session)
    /// as a no-op, matching the fire-and-forget contract in spec §4.2.
    pub fn schedule_send(&self, endpoint_id: u64, message: OutboundMessage) -> Result<bool, crate::error::Error> {
        let endpoints = self.inner.endpoints.lock();
        let registration = endpoints
            .get(&endpoint_id)
            .ok_or(crate::error::Error::UnknownEndpoint(endpoint_id))?;
        let sent = (registration.send_action)(message);
        drop(endpoints);
        if sent {
            self.inner.sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(sent)
    }

    fn preferred_endpoint(&self) -> Option<u64> {
        self.inner.endpoints.lock().keys().min().copied()
    }

    /// Stages an awaitable request via `tracking`, attaches the
    /// `Awaitable{Request, key}` extension and sends through the
    /// preferred (first-registered) endpoint.
    pub fn request(
        self: &Arc<Self>,
        tracking: &TrackingService,
        builder: RequestBuilder,
        on_response: impl Fn(crate::tracking::Response) + Send + Sync + 'static,
        on_error: impl Fn(crate::tracking::Response) + Send + Sync + 'static,
    ) -> Result<TrackerKey, crate::error::Error> {
        let endpoint_id = self.preferred_endpoint().ok_or(crate::error::Error::NoReceiver)?;
        let peer = self.identifier();

        let key = tracking.stage_request(self.local_identifier, [peer], on_response, on_error);

        let mut header = codec::frame::Header::new(0, 0, self.local_identifier.internal().to_vec());
        header.destination_identifier = Some(peer.internal().to_vec());
        header.route = builder.route;
        let parcel = ApplicationParcel::new(header, builder.payload, Vec::new()).with_awaitable(Awaitable {
            binding: AwaitableBinding::Request,
            tracker_key: key.as_bytes(),
        });

        let encoded = codec::frame::encode(&parcel.frame)?;
        self.schedule_send(endpoint_id, OutboundMessage::Owned(encoded))?;
        Ok(key)
    }

    /// Creates or refreshes the registration for `endpoint_id`, binds its
    /// message-context closures, marks `address` connected and notifies
    /// the resolution service (spec §4.6).
    pub fn register_endpoint(
        &self,
        endpoint_id: u64,
        protocol: Protocol,
        address: Address,
        send_action: SendAction,
        disconnect_action: DisconnectAction,
    ) {
        {
            let mut endpoints = self.inner.endpoints.lock();
            let mut associated = self.inner.associated_addresses.lock();
            endpoints.insert(
                endpoint_id,
                Registration {
                    protocol,
                    address: address.clone(),
                    send_action,
                    disconnect_action,
                },
            );
            associated.insert(address, true);
        }

        if let Some(observer) = self.inner.resolution_observer.lock().as_ref().and_then(Weak::upgrade) {
            observer.on_endpoint_registered(self.identifier(), protocol);
        }
    }

    /// Removes `endpoint_id`'s registration and notifies the resolution
    /// service (spec §4.6). If it was the last one, resets the cipher
    /// package, enabled receiver and authorization.
    pub fn withdraw_endpoint(&self, endpoint_id: u64, cause: WithdrawalCause) -> bool {
        let (removed, became_empty) = {
            let mut endpoints = self.inner.endpoints.lock();
            let mut associated = self.inner.associated_addresses.lock();
            let removed = endpoints.remove(&endpoint_id);
            if let Some(registration) = &removed {
                associated.insert(registration.address.clone(), false);
            }
            (removed.is_some(), endpoints.is_empty())
        };

        if became_empty {
            *self.inner.cipher.write() = None;
            *self.inner.receiver.lock() = None;
            *self.inner.authorization.lock() = Authorization::Unauthorized;
            *self.inner.resolver.lock() = None;
        }

        if removed {
            if let Some(observer) = self.inner.resolution_observer.lock().as_ref().and_then(Weak::upgrade) {
                observer.on_endpoint_withdrawn(self.identifier(), cause);
            }
        }

        removed
    }

    /// Installs `resolver`'s exchange processor as the enabled receiver.
    /// Only valid when no resolver is currently attached.
    pub fn attach_resolver(&self, resolver: Resolver) -> Result<(), crate::error::Error> {
        let mut slot = self.inner.resolver.lock();
        if slot.is_some() {
            return Err(crate::error::Error::ResolverAlreadyAttached);
        }
        *self.inner.receiver.lock() = Some(Arc::new(ExchangeReceiver(resolver.exchange.clone())) as Arc<dyn MessageSink>);
        *slot = Some(resolver);
        Ok(())
    }

    /// Creates a resolver pre-configured for `role` and attaches it. `prepare()`
    /// runs `initialize()` exactly once for either role (spec §4.5) and moves
    /// the processor into `Synchronization`; the Acceptor's `initialize()`
    /// produces no first message, so its `None` is discarded here (there is
    /// no registered endpoint yet to push a parcel through when this runs
    /// ahead of a connect — see `manager::declare_resolving_peer`).
    pub fn start_exchange(
        self: &Arc<Self>,
        role: Role,
        connect_protocol: Option<Arc<dyn crate::exchange::ConnectProtocol>>,
    ) -> (Arc<ExchangeProcessor>, Option<PlatformParcel>) {
        let exchange = Arc::new(ExchangeProcessor::new(
            role,
            self.local_identifier,
            self.clone() as Arc<dyn ExchangeObserver>,
            connect_protocol,
            self.clone() as Arc<dyn PlatformSink>,
        ));
        let _ = self.attach_resolver(Resolver { exchange: exchange.clone() });
        let first = exchange.prepare();
        (exchange, first)
    }

    /// Calls every registration's disconnect action.
    pub fn schedule_disconnect(&self) {
        for registration in self.inner.endpoints.lock().values() {
            (registration.disconnect_action)();
        }
    }
}

/// Adapts an [`ExchangeProcessor`] to the generic [`MessageSink`]
/// capability a proxy's enabled receiver must expose. The processor only
/// understands platform parcels; anything else is a protocol violation
/// and is rejected.
struct ExchangeReceiver(Arc<ExchangeProcessor>);

impl MessageSink for ExchangeReceiver {
    fn collect_message(&self, context: &MessageContext, buffer: &[u8]) -> bool {
        let decoded = match codec::frame::decode(std::str::from_utf8(buffer).unwrap_or_default()) {
            Ok(frame) => frame,
            Err(_) => return false,
        };
        let parcel = PlatformParcel::new(decoded.header, decoded.payload, decoded.validator);
        self.0.collect_handshake(context, &parcel)
    }
}

impl ProxyHandle for Proxy {
    fn identifier(&self) -> Identifier {
        self.identifier()
    }

    fn cipher(&self) -> Option<Arc<CipherPackage>> {
        self.cipher()
    }
}

impl ResponseSink for Proxy {
    fn send_application(&self, parcel: ApplicationParcel) {
        if let Some(endpoint_id) = self.preferred_endpoint() {
            if let Ok(encoded) = codec::frame::encode(&parcel.frame) {
                let _ = self.schedule_send(endpoint_id, OutboundMessage::Owned(encoded));
            }
        }
    }
}

impl PlatformSink for Proxy {
    fn send_platform(&self, parcel: PlatformParcel) -> bool {
        match self.preferred_endpoint() {
            Some(endpoint_id) => match codec::frame::encode(&parcel.frame) {
                Ok(encoded) => self.schedule_send(endpoint_id, OutboundMessage::Owned(encoded)).unwrap_or(false),
                Err(_) => false,
            },
            None => false,
        }
    }
}

impl ExchangeObserver for Proxy {
    fn on_success(&self, cipher: Arc<CipherPackage>) {
        *self.inner.cipher.write() = Some(cipher);
        *self.inner.authorization.lock() = Authorization::Authorized;
        *self.inner.resolver.lock() = None;
        // The authorized receiver is installed by whoever owns the
        // application message sink (the router), via `install_sink`.
    }

    fn on_failure(&self) {
        *self.inner.receiver.lock() = None;
        *self.inner.authorization.lock() = Authorization::Unauthorized;
        *self.inner.resolver.lock() = None;
    }
}

impl Proxy {
    /// Swaps the enabled receiver to the authorized application sink.
    /// Called by the router once it sees authorization flip to
    /// `Authorized` (normally from the same callback path as
    /// `on_success`, kept separate here so the router owns the sink type).
    pub fn install_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.inner.receiver.lock() = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    #[test]
    fn register_and_withdraw_resets_state_on_last_endpoint() {
        let proxy = Proxy::new(identifier(0), identifier(1));
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        proxy.register_endpoint(1, Protocol::Tcp, address, Box::new(|_| true), Box::new(|| {}));
        assert!(proxy.is_active());

        proxy.withdraw_endpoint(1, WithdrawalCause::SessionClosure);
        assert!(!proxy.is_active());
        assert_eq!(proxy.authorization(), Authorization::Unauthorized);
        assert!(proxy.cipher().is_none());
    }

    #[test]
    fn schedule_send_on_unknown_endpoint_errors() {
        let proxy = Proxy::new(identifier(0), identifier(1));
        assert!(proxy.schedule_send(42, OutboundMessage::Owned("x".into())).is_err());
    }

    #[test]
    fn schedule_receive_without_receiver_errors() {
        let proxy = Proxy::new(identifier(0), identifier(1));
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        proxy.register_endpoint(1, Protocol::Tcp, address, Box::new(|_| true), Box::new(|| {}));
        assert!(proxy.schedule_receive(1, b"x").is_err());
    }
}
