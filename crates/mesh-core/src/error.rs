use thiserror::Error;

/// Error taxonomy for `mesh-core` (spec §7). Kinds, not exhaustive wire
/// detail — each variant is the thing a caller needs to branch on, not a
/// rendering of the underlying cause.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no proxy is registered under identifier or address")]
    UnknownPeer,

    #[error("a proxy already exists for this identifier or address")]
    PeerAlreadyExists,

    #[error("address is already resolving")]
    AlreadyResolving,

    #[error("endpoint {0} is not registered on this proxy")]
    UnknownEndpoint(u64),

    #[error("proxy has no enabled receiver")]
    NoReceiver,

    #[error("a resolver is already attached to this proxy")]
    ResolverAlreadyAttached,

    #[error("exchange processor received a message outside of Synchronization")]
    NotSynchronizing,

    #[error("handshake parcel addressed to a different node")]
    MisaddressedHandshake,

    #[error("handshake synchronizer failed: {0}")]
    SynchronizerFailed(#[from] crypto::error::Error),

    #[error("wire framing error: {0}")]
    Framing(#[from] codec::error::Error),

    #[error("tracker key not found")]
    UnknownTracker,

    #[error("response source is not part of this tracker's ledger")]
    UnexpectedResponder,

    #[error("duplicate response for an already-responded identifier")]
    DuplicateResponse,

    #[error("binding failure: {0:?}")]
    Binding(crate::events::BindingFailureCause),

    #[error("connection failure: {0:?}")]
    Connection(crate::events::ConnectionFailureCause),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
