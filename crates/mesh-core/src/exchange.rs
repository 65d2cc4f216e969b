//! The handshake state machine that sits as a proxy's "enabled receiver"
//! during synchronization (spec §4.5).
//!
//! `Initialization -> Synchronization -> { Success | Failure }`. The
//! processor does not interpret handshake payloads itself — it drives a
//! [`crypto::kem::Synchronizer`] and only looks at the platform-parcel
//! envelope around those payloads (destination routing, not content).

use crate::context::MessageContext;
use crate::identifier::Identifier;
use codec::frame::Header;
use codec::message::{PlatformParcel, PlatformType};
use crypto::cipher::CipherPackage;
use crypto::kem::{Role, Synchronizer, SynchronizerStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const DESTINATION_NODE: u8 = 0;
const PROTOCOL_PLATFORM: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeStatus {
    Initialization = 0,
    Synchronization = 1,
    Success = 2,
    Failure = 3,
}

impl ExchangeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExchangeStatus::Initialization,
            1 => ExchangeStatus::Synchronization,
            2 => ExchangeStatus::Success,
            _ => ExchangeStatus::Failure,
        }
    }
}

/// Notified when the processor leaves Synchronization, one way or the
/// other. Implemented by the proxy that owns this processor's resolver.
pub trait ExchangeObserver: Send + Sync {
    fn on_success(&self, cipher: Arc<CipherPackage>);
    fn on_failure(&self);
}

/// Something that can dispatch the post-handshake application-level
/// connect request. Only the Initiator side invokes this, once, right
/// after `finalize()` succeeds.
pub trait ConnectProtocol: Send + Sync {
    fn send_request(&self, peer: Identifier);
}

/// Something that can push a platform parcel out through the proxy's
/// first registered endpoint. Implemented by `crate::proxy::Proxy`.
pub trait PlatformSink: Send + Sync {
    fn send_platform(&self, parcel: PlatformParcel) -> bool;
}

/// Drives one side of the handshake to completion against a single peer.
pub struct ExchangeProcessor {
    role: Role,
    local_identifier: Identifier,
    status: AtomicU8,
    synchronizer: parking_lot::Mutex<Option<Synchronizer>>,
    observer: Arc<dyn ExchangeObserver>,
    connect_protocol: Option<Arc<dyn ConnectProtocol>>,
    sink: Arc<dyn PlatformSink>,
}

impl ExchangeProcessor {
    pub fn new(
        role: Role,
        local_identifier: Identifier,
        observer: Arc<dyn ExchangeObserver>,
        connect_protocol: Option<Arc<dyn ConnectProtocol>>,
        sink: Arc<dyn PlatformSink>,
    ) -> Self {
        let synchronizer = match role {
            Role::Initiator => Synchronizer::initiator(),
            Role::Acceptor => Synchronizer::acceptor(),
        };
        Self {
            role,
            local_identifier,
            status: AtomicU8::new(ExchangeStatus::Initialization as u8),
            synchronizer: parking_lot::Mutex::new(Some(synchronizer)),
            observer,
            connect_protocol,
            sink,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ExchangeStatus {
        ExchangeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ExchangeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Invoked exactly once, right after construction. Initiators get a
    /// first handshake parcel back — the caller is responsible for
    /// delivering it (there is no registered endpoint to push through yet
    /// when this runs ahead of a connect, see `manager::declare_resolving_peer`).
    /// Acceptors have nothing to send yet and get `None`.
    pub fn prepare(&self) -> Option<PlatformParcel> {
        let out = {
            let mut guard = self.synchronizer.lock();
            match guard.as_mut().map(|s| s.initialize()) {
                Some(Ok(out)) => out,
                Some(Err(_)) => {
                    self.set_status(ExchangeStatus::Failure);
                    self.observer.on_failure();
                    return None;
                }
                None => return None,
            }
        };

        self.set_status(ExchangeStatus::Synchronization);
        out.map(|payload| self.build_handshake(payload))
    }

    fn build_handshake(&self, payload: Vec<u8>) -> PlatformParcel {
        let header = Header::new(
            PROTOCOL_PLATFORM,
            DESTINATION_NODE,
            self.local_identifier.internal().to_vec(),
        );
        PlatformParcel::new(header, payload, Vec::new()).with_platform_type(PlatformType::Handshake)
    }

    fn send_handshake(&self, payload: Vec<u8>) {
        self.sink.send_platform(self.build_handshake(payload));
    }

    fn fail(&self) {
        self.set_status(ExchangeStatus::Failure);
        self.observer.on_failure();
    }

    /// Feeds one inbound handshake parcel through the synchronizer. Only
    /// valid while `status() == Synchronization`.
    pub fn collect_handshake(&self, context: &MessageContext, parcel: &PlatformParcel) -> bool {
        if self.status() != ExchangeStatus::Synchronization {
            return false;
        }

        if parcel.frame.header.protocol != PROTOCOL_PLATFORM || parcel.frame.header.destination_type != DESTINATION_NODE {
            self.fail();
            return false;
        }
        if let Some(destination) = &parcel.frame.header.destination_identifier {
            if destination.as_slice() != self.local_identifier.internal() {
                self.fail();
                return false;
            }
        }

        let next = {
            let mut guard = self.synchronizer.lock();
            match guard.as_mut().map(|s| s.synchronize(&parcel.payload)) {
                Some(Ok(next)) => next,
                Some(Err(_)) | None => {
                    self.fail();
                    return false;
                }
            }
        };

        if let Some(payload) = next {
            self.send_handshake(payload);
        }

        let ready = self
            .synchronizer
            .lock()
            .as_ref()
            .map(|s| s.status() == SynchronizerStatus::Success)
            .unwrap_or(false);

        if !ready {
            return true;
        }

        let synchronizer = self.synchronizer.lock().take();
        let cipher = match synchronizer.map(|s| s.finalize()) {
            Some(Ok(cipher)) => cipher,
            _ => {
                self.fail();
                return false;
            }
        };

        self.set_status(ExchangeStatus::Success);
        let cipher = Arc::new(cipher);
        self.observer.on_success(cipher);

        if self.role == Role::Initiator {
            if let Some(protocol) = &self.connect_protocol {
                protocol.send_request(self.local_identifier);
            }
        }

        let _ = context;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    struct RecordingObserver {
        success: AtomicBool,
        failure: AtomicBool,
    }

    impl ExchangeObserver for RecordingObserver {
        fn on_success(&self, _cipher: Arc<CipherPackage>) {
            self.success.store(true, Ordering::SeqCst);
        }
        fn on_failure(&self) {
            self.failure.store(true, Ordering::SeqCst);
        }
    }

    struct CapturingSink {
        sent: Mutex<Vec<PlatformParcel>>,
    }

    impl PlatformSink for CapturingSink {
        fn send_platform(&self, parcel: PlatformParcel) -> bool {
            self.sent.lock().unwrap().push(parcel);
            true
        }
    }

    struct CountingConnect(AtomicUsize);
    impl ConnectProtocol for CountingConnect {
        fn send_request(&self, _peer: Identifier) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    #[test]
    fn full_handshake_reaches_success_on_both_sides() {
        let initiator_observer = Arc::new(RecordingObserver {
            success: AtomicBool::new(false),
            failure: AtomicBool::new(false),
        });
        let acceptor_observer = Arc::new(RecordingObserver {
            success: AtomicBool::new(false),
            failure: AtomicBool::new(false),
        });
        let initiator_sink = Arc::new(CapturingSink { sent: Mutex::new(Vec::new()) });
        let acceptor_sink = Arc::new(CapturingSink { sent: Mutex::new(Vec::new()) });
        let connect = Arc::new(CountingConnect(AtomicUsize::new(0)));

        let initiator = ExchangeProcessor::new(
            Role::Initiator,
            identifier(1),
            initiator_observer.clone(),
            Some(connect.clone()),
            initiator_sink.clone(),
        );
        let acceptor = ExchangeProcessor::new(
            Role::Acceptor,
            identifier(2),
            acceptor_observer.clone(),
            None,
            acceptor_sink.clone(),
        );

        let stage1 = initiator.prepare().expect("initiator produces the first handshake payload");
        assert_eq!(initiator.status(), ExchangeStatus::Synchronization);

        assert!(acceptor.prepare().is_none());
        assert_eq!(acceptor.status(), ExchangeStatus::Synchronization);

        let dummy_proxy: std::sync::Weak<dyn crate::context::ProxyHandle> = std::sync::Weak::new();
        let context = MessageContext::new(1, codec::address::Protocol::Tcp, dummy_proxy);

        assert!(acceptor.collect_handshake(&context, &stage1));
        assert_eq!(acceptor.status(), ExchangeStatus::Success);
        assert!(acceptor_observer.success.load(Ordering::SeqCst));

        let stage2 = acceptor_sink.sent.lock().unwrap().remove(0);
        assert!(initiator.collect_handshake(&context, &stage2));
        assert_eq!(initiator.status(), ExchangeStatus::Success);
        assert!(initiator_observer.success.load(Ordering::SeqCst));
        assert_eq!(connect.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misaddressed_handshake_fails_the_processor() {
        let observer = Arc::new(RecordingObserver {
            success: AtomicBool::new(false),
            failure: AtomicBool::new(false),
        });
        let sink = Arc::new(CapturingSink { sent: Mutex::new(Vec::new()) });
        let acceptor = ExchangeProcessor::new(Role::Acceptor, identifier(2), observer.clone(), None, sink);
        acceptor.prepare();

        let mut header = Header::new(1, DESTINATION_NODE, identifier(9).internal().to_vec());
        header.destination_identifier = Some(identifier(99).internal().to_vec());
        let parcel = PlatformParcel::new(header, vec![0u8; 4], Vec::new());

        let dummy_proxy: std::sync::Weak<dyn crate::context::ProxyHandle> = std::sync::Weak::new();
        let context = MessageContext::new(1, codec::address::Protocol::Tcp, dummy_proxy);

        assert!(!acceptor.collect_handshake(&context, &parcel));
        assert_eq!(acceptor.status(), ExchangeStatus::Failure);
        assert!(observer.failure.load(Ordering::SeqCst));
    }
}
