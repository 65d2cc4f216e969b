//! The authorized application sink (spec §4.6): once a peer's handshake
//! finishes, its proxy's enabled receiver is swapped from the exchange
//! processor to this sink via `Proxy::install_sink`.

use std::sync::{Arc, Weak};

use mesh_core::context::{MessageContext, MessageSink};
use mesh_core::manager::{PeerFilter, PeerManager};
use mesh_core::proxy::Authorization;
use mesh_core::scheduler::Delegate;
use mesh_core::tracking::{ProcessOutcome, TrackingService};
use codec::message::{ApplicationParcel, AwaitableBinding};

use crate::statistics::{Stat, Statistics};

/// Installs itself on every proxy that has reached `Authorized` but hasn't
/// been handed this sink yet, and processes application traffic for every
/// proxy it is installed on.
pub struct Router {
    self_ref: Weak<Router>,
    manager: Arc<PeerManager>,
    tracking: Arc<TrackingService>,
    statistics: Statistics,
}

impl Router {
    pub fn new(manager: Arc<PeerManager>, tracking: Arc<TrackingService>, statistics: Statistics) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            manager,
            tracking,
            statistics,
        })
    }
}

impl MessageSink for Router {
    fn collect_message(&self, context: &MessageContext, buffer: &[u8]) -> bool {
        let frame = match codec::frame::decode(std::str::from_utf8(buffer).unwrap_or_default()) {
            Ok(frame) => frame,
            Err(_) => return false,
        };
        let peer = match context.peer_identifier() {
            Some(peer) => peer,
            None => return false,
        };

        self.statistics.record(peer, Stat::ReceivedBytes(buffer.len()));
        self.statistics.record(peer, Stat::ReceivedPkts(1));

        let parcel = ApplicationParcel::new(frame.header, frame.payload, frame.validator);

        match parcel.awaitable() {
            Ok(Some(awaitable)) if awaitable.binding == AwaitableBinding::Response => {
                let key = mesh_core::tracking::TrackerKey::from_bytes(awaitable.tracker_key);
                matches!(
                    self.tracking.process(key, peer, parcel),
                    ProcessOutcome::Partial | ProcessOutcome::Fulfilled
                )
            }
            Ok(_) => {
                log::debug!("application parcel from {peer}: {} byte payload", parcel.frame.payload.len());
                true
            }
            Err(_) => false,
        }
    }
}

impl Delegate for Router {
    fn name(&self) -> &str {
        "application-sink-install"
    }

    fn execute(&self) {
        let Some(sink) = self.self_ref.upgrade() else {
            return;
        };
        for proxy in self.manager.filter(PeerFilter::Active) {
            if proxy.authorization() == Authorization::Authorized {
                proxy.install_sink(sink.clone() as Arc<dyn MessageSink>);
            }
        }
    }
}
