//! One binding's listener plus its outbound connect delegates (spec §4.2).
//!
//! A [`TcpEndpoint`] is the accept loop and the connect-delegate bookkeeping
//! for a single bound address. Sessions themselves (`crate::session::Session`)
//! are spawned by both paths but owned by the endpoint's session registry so
//! shutdown can reach every live connection.

use crate::events::{BindingFailureCause, ConnectionFailureCause, Event, EventPublisher, WithdrawalCause};
use crate::exchange::ConnectProtocol;
use crate::identifier::Identifier;
use crate::manager::PeerManager;
use crate::proxy::{OutboundMessage, Proxy};
use crate::session::{OnReceived, OnStopped, Session, StopCause};
use codec::address::{Address, Protocol};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Connect/retry defaults (spec §5): 15s connect deadline, 5s retry
/// interval, 3 retries. `idle_timeout` (teacher's `Interface::idle_timeout`
/// convention) bounds how long a session may go without a new frame
/// starting to arrive before it is treated as dead.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_limit: u32,
    pub idle_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_secs(5),
            retry_limit: 3,
            idle_timeout: Duration::from_secs(20),
        }
    }
}

/// Why `TcpEndpoint::connect` declined to dial without ever attempting a
/// socket connect (spec §4.2 "conflict policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRejection {
    Reflective,
    Duplicate,
    InProgress,
}

struct PendingLink {
    proxy: parking_lot::Mutex<Option<Arc<Proxy>>>,
    linked: AtomicBool,
}

impl PendingLink {
    fn known(proxy: Arc<Proxy>) -> Self {
        Self {
            proxy: parking_lot::Mutex::new(Some(proxy)),
            linked: AtomicBool::new(true),
        }
    }

    fn unresolved() -> Self {
        Self {
            proxy: parking_lot::Mutex::new(None),
            linked: AtomicBool::new(false),
        }
    }
}

/// One bound address's listener and connect delegates (spec §4.2).
pub struct TcpEndpoint {
    bind_address: Address,
    local_identifier: Identifier,
    manager: Arc<PeerManager>,
    events: Arc<EventPublisher>,
    config: EndpointConfig,
    sessions: parking_lot::Mutex<ahash::HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    /// Addresses this endpoint currently has an established (not merely
    /// resolving) session for — an endpoint-local cache so `connect`'s
    /// duplicate check doesn't need a new public query surface on
    /// `PeerManager`/`Proxy`. Cleared on withdrawal.
    connected: parking_lot::Mutex<HashSet<Address>>,
    shutdown: AtomicBool,
}

impl TcpEndpoint {
    pub fn new(bind_address: Address, local_identifier: Identifier, manager: Arc<PeerManager>, events: Arc<EventPublisher>, config: EndpointConfig) -> Arc<Self> {
        Arc::new(Self {
            bind_address,
            local_identifier,
            manager,
            events,
            config,
            sessions: parking_lot::Mutex::new(ahash::HashMap::default()),
            next_session_id: AtomicU64::new(1),
            connected: parking_lot::Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn bind_address(&self) -> &Address {
        &self.bind_address
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Binds and enters the accept loop on the current runtime. Returns
    /// once the listener fails to bind; accept-loop errors are published
    /// as events and do not return control to the caller.
    pub async fn listen(self: &Arc<Self>) -> Result<(), BindingFailureCause> {
        let socket_addr = self.socket_addr().map_err(|_| BindingFailureCause::UnexpectedError)?;

        let socket = match socket_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|_| BindingFailureCause::UnexpectedError)?;

        if socket.set_reuseaddr(true).is_err() {
            return Err(BindingFailureCause::UnexpectedError);
        }

        if let Err(e) = socket.bind(socket_addr) {
            let cause = classify_bind_error(&e);
            self.events.publish(Event::BindingFailed {
                address: self.bind_address.clone(),
                cause,
            });
            self.manager.on_binding_failure(cause);
            return Err(cause);
        }

        let listener = match socket.listen(1024) {
            Ok(listener) => listener,
            Err(e) => {
                let cause = classify_bind_error(&e);
                self.events.publish(Event::BindingFailed {
                    address: self.bind_address.clone(),
                    cause,
                });
                self.manager.on_binding_failure(cause);
                return Err(cause);
            }
        };

        self.events.publish(Event::EndpointStarted { address: self.bind_address.clone() });
        log::info!("endpoint listening on {}", self.bind_address);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.events.publish(Event::EndpointStopped { address: self.bind_address.clone() });
                return Ok(());
            }

            match listener.accept().await {
                Ok((stream, remote)) => {
                    let address = match Address::parse(Protocol::Tcp, &remote.to_string()) {
                        Ok(address) => address,
                        Err(_) => continue,
                    };
                    self.accept_session(stream, address);
                }
                Err(e) => {
                    log::warn!("accept failed on {}: {}", self.bind_address, e);
                    self.events.publish(Event::BindingFailed {
                        address: self.bind_address.clone(),
                        cause: BindingFailureCause::UnexpectedError,
                    });
                }
            }
        }
    }

    /// Stops the accept loop and every live session (spec §5
    /// "Cancellation").
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for session in self.sessions.lock().values() {
            session.stop(StopCause::Requested);
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, ()> {
        self.bind_address.authority().parse().map_err(|_| ())
    }

    fn accept_session(self: &Arc<Self>, stream: TcpStream, address: Address) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(PendingLink::unresolved());
        let (on_received, on_stopped) = self.handlers(id, address.clone(), link);

        let session = Session::spawn(id, address, stream, self.config.idle_timeout, on_received, on_stopped);
        self.sessions.lock().insert(id, session);
    }

    /// Builds the receiver/stop callbacks shared by both the accept and
    /// connect paths. `link` is pre-filled for outbound sessions (the
    /// proxy is already known before the socket connects) and empty for
    /// inbound ones (the peer's identity is learned from its first frame).
    fn handlers(self: &Arc<Self>, endpoint_id: u64, address: Address, link: Arc<PendingLink>) -> (OnReceived, OnStopped) {
        let endpoint = self.clone();
        let received_address = address.clone();
        let stopped_link = link.clone();

        let on_received: OnReceived = Arc::new(move |session, buffer| {
            let proxy = match endpoint.resolve_proxy(&link, endpoint_id, &received_address, session, buffer) {
                Some(proxy) => proxy,
                None => return false,
            };
            matches!(proxy.schedule_receive(endpoint_id, buffer), Ok(true))
        });

        let endpoint = self.clone();
        let on_stopped: OnStopped = Arc::new(move |cause| {
            endpoint.on_session_stopped(endpoint_id, &address, &stopped_link, cause);
        });

        (on_received, on_stopped)
    }

    /// Returns the proxy this session belongs to, registering the
    /// endpoint with it on the first successful frame if it wasn't known
    /// up front.
    fn resolve_proxy(self: &Arc<Self>, link: &Arc<PendingLink>, endpoint_id: u64, address: &Address, session: &Arc<Session>, buffer: &[u8]) -> Option<Arc<Proxy>> {
        if link.linked.load(Ordering::Acquire) {
            return link.proxy.lock().clone();
        }

        let decoded = codec::frame::decode(std::str::from_utf8(buffer).ok()?).ok()?;
        let identifier = Identifier::from_slice(&decoded.header.source_identifier)?;
        if !identifier.is_valid() {
            return None;
        }

        let proxy = self.manager.link_peer(address, identifier).ok()?;
        self.register(&proxy, endpoint_id, address.clone(), session);

        *link.proxy.lock() = Some(proxy.clone());
        link.linked.store(true, Ordering::Release);
        Some(proxy)
    }

    fn register(&self, proxy: &Arc<Proxy>, endpoint_id: u64, address: Address, session: &Arc<Session>) {
        let send_session = session.clone();
        let disconnect_session = session.clone();
        proxy.register_endpoint(
            endpoint_id,
            Protocol::Tcp,
            address.clone(),
            Box::new(move |message: OutboundMessage| send_session.enqueue(message)),
            Box::new(move || disconnect_session.stop(StopCause::Requested)),
        );
        self.connected.lock().insert(address);
    }

    fn on_session_stopped(&self, endpoint_id: u64, address: &Address, link: &PendingLink, cause: StopCause) {
        self.sessions.lock().remove(&endpoint_id);
        self.connected.lock().remove(address);

        let withdrawal = match cause {
            StopCause::Requested => WithdrawalCause::DisconnectRequest,
            StopCause::Closed => WithdrawalCause::SessionClosure,
            StopCause::UnexpectedError => WithdrawalCause::UnexpectedError,
        };

        if let Some(proxy) = link.proxy.lock().clone() {
            proxy.withdraw_endpoint(endpoint_id, withdrawal);
        }
    }

    /// Dials `address`, retrying per `self.config` (spec §4.2 step d/e).
    /// `identifier`, when the peer is pre-configured, lets the caller skip
    /// straight to a confirmed proxy instead of waiting for the first
    /// inbound frame to reveal it.
    pub async fn connect(self: &Arc<Self>, address: Address, identifier: Option<Identifier>, connect_protocol: Option<Arc<dyn ConnectProtocol>>) -> Result<(), ConnectRejection> {
        if address == self.bind_address {
            self.events.publish(Event::ConnectionFailed {
                address,
                cause: ConnectionFailureCause::Reflective,
            });
            return Err(ConnectRejection::Reflective);
        }
        if self.connected.lock().contains(&address) {
            self.events.publish(Event::ConnectionFailed {
                address,
                cause: ConnectionFailureCause::Duplicate,
            });
            return Err(ConnectRejection::Duplicate);
        }

        let declared = match self.manager.declare_resolving_peer(address.clone(), identifier, connect_protocol) {
            Ok(Some(declared)) => declared,
            Ok(None) => {
                self.events.publish(Event::ConnectionFailed {
                    address,
                    cause: ConnectionFailureCause::InProgress,
                });
                return Err(ConnectRejection::InProgress);
            }
            Err(_) => {
                self.events.publish(Event::ConnectionFailed {
                    address,
                    cause: ConnectionFailureCause::Duplicate,
                });
                return Err(ConnectRejection::Duplicate);
            }
        };
        let (proxy, first_parcel) = declared;

        let socket_addr: SocketAddr = match address.authority().parse() {
            Ok(a) => a,
            Err(_) => {
                self.manager.rescind_resolving_peer(&address);
                self.events.publish(Event::ConnectionFailed {
                    address,
                    cause: ConnectionFailureCause::UnexpectedError,
                });
                return Ok(());
            }
        };

        let stream = match self.dial_with_retry(socket_addr, &address).await {
            Some(stream) => stream,
            None => {
                self.manager.rescind_resolving_peer(&address);
                return Ok(());
            }
        };

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(PendingLink::known(proxy.clone()));
        let (on_received, on_stopped) = self.handlers(id, address.clone(), link);

        let session = Session::spawn(id, address.clone(), stream, self.config.idle_timeout, on_received, on_stopped);
        self.register(&proxy, id, address, &session);

        if let Some(parcel) = first_parcel {
            if let Ok(encoded) = codec::frame::encode(&parcel.frame) {
                session.enqueue(OutboundMessage::Owned(encoded));
            }
        }

        self.sessions.lock().insert(id, session);
        Ok(())
    }

    async fn dial_with_retry(&self, socket_addr: SocketAddr, address: &Address) -> Option<TcpStream> {
        for attempt in 0..=self.config.retry_limit {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(e)) => log::warn!("connect to {} failed: {}", address, e),
                Err(_) => log::warn!("connect to {} timed out", address),
            }

            if attempt == self.config.retry_limit {
                self.events.publish(Event::ConnectionFailed {
                    address: address.clone(),
                    cause: ConnectionFailureCause::RetriesExhausted,
                });
                return None;
            }

            tokio::time::sleep(self.config.retry_interval).await;
        }
        None
    }
}

fn classify_bind_error(e: &std::io::Error) -> BindingFailureCause {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => BindingFailureCause::AddressInUse,
        std::io::ErrorKind::PermissionDenied => BindingFailureCause::Permissions,
        _ => BindingFailureCause::UnexpectedError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    fn endpoint(address: &str) -> Arc<TcpEndpoint> {
        let bind_address = Address::parse(Protocol::Tcp, address).unwrap();
        let manager = PeerManager::new(identifier(0), Arc::new(EventPublisher::new()));
        TcpEndpoint::new(bind_address, identifier(0), manager, Arc::new(EventPublisher::new()), EndpointConfig::default())
    }

    #[tokio::test]
    async fn connect_to_own_binding_is_reflective() {
        let endpoint = endpoint("127.0.0.1:35216");
        let target = Address::parse(Protocol::Tcp, "127.0.0.1:35216").unwrap();
        let result = endpoint.connect(target, None, None).await;
        assert_eq!(result, Err(ConnectRejection::Reflective));
    }

    #[tokio::test]
    async fn listen_then_connect_establishes_a_session() {
        // Bind through a probe socket first so the test knows the ephemeral
        // port before the real endpoint (with SO_REUSEADDR) takes it over.
        let probe = TcpSocket::new_v4().unwrap();
        probe.set_reuseaddr(true).unwrap();
        probe.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let bound = probe.local_addr().unwrap();
        drop(probe);

        let bind_address = Address::parse(Protocol::Tcp, &bound.to_string()).unwrap();
        let manager = PeerManager::new(identifier(1), Arc::new(EventPublisher::new()));
        let server = TcpEndpoint::new(bind_address.clone(), identifier(1), manager, Arc::new(EventPublisher::new()), EndpointConfig::default());
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.listen().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = endpoint("127.0.0.1:0");
        let result = client.connect(bind_address, Some(identifier(2)), None).await;
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.session_count(), 1);

        server.shutdown();
        let _ = server_task.await;
    }
}
