//! Ephemeral binding of a parcel to the endpoint and cryptographic
//! handlers used to produce or validate it (spec §3, §6).

use crate::identifier::Identifier;
use codec::address::Protocol;
use crypto::cipher::CipherPackage;
use std::sync::{Arc, Weak};

/// What a [`MessageContext`] needs to reach back into, non-owning: the
/// proxy that registered the endpoint this message arrived on or will be
/// sent through.
pub trait ProxyHandle: Send + Sync {
    fn identifier(&self) -> Identifier;
    fn cipher(&self) -> Option<Arc<CipherPackage>>;
}

/// Binds a parcel to the endpoint it crossed and the proxy whose cipher
/// package produced/will validate it. Built fresh per `ScheduleReceive`
/// call; never stored past the call that created it.
pub struct MessageContext {
    endpoint_id: u64,
    protocol: Protocol,
    proxy: Weak<dyn ProxyHandle>,
}

impl MessageContext {
    pub fn new(endpoint_id: u64, protocol: Protocol, proxy: Weak<dyn ProxyHandle>) -> Self {
        Self {
            endpoint_id,
            protocol,
            proxy,
        }
    }

    pub fn endpoint_id(&self) -> u64 {
        self.endpoint_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer_identifier(&self) -> Option<Identifier> {
        self.proxy.upgrade().map(|proxy| proxy.identifier())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        self.proxy.upgrade()?.cipher()?.encrypt(plaintext).ok()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.proxy.upgrade()?.cipher()?.decrypt(ciphertext).ok()
    }

    pub fn sign(&self, data: &[u8]) -> Option<[u8; crypto::cipher::SIGNATURE_LEN]> {
        Some(self.proxy.upgrade()?.cipher()?.sign(data))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.proxy.upgrade().and_then(|p| p.cipher()) {
            Some(cipher) => cipher.verify(data, signature).is_ok(),
            None => false,
        }
    }
}

/// A capability interface for a proxy's "enabled receiver" — either the
/// handshake exchange processor or the authorized application sink
/// (spec §9 DESIGN NOTES: model polymorphic receivers as a tagged
/// variant or a capability interface, swapped atomically).
pub trait MessageSink: Send + Sync {
    /// Returning `false` instructs the session to treat the message as
    /// fatal for the session (spec §6).
    fn collect_message(&self, context: &MessageContext, buffer: &[u8]) -> bool;
}
