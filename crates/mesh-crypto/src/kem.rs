//! Hybrid post-quantum + classical handshake.
//!
//! Two round trips exchange an ML-KEM-768 ciphertext and an X25519 public
//! key; the two resulting shared secrets are folded together with
//! HKDF-SHA256 into the key material backing a [`crate::cipher::CipherPackage`].
//! Neither secret alone is trusted: ML-KEM is the quantum-resistant half,
//! X25519 is the classical half that keeps the handshake authenticated
//! against a weakness discovered in ML-KEM alone.

use crate::cipher::CipherPackage;
use crate::error::Error;
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

type Kem = MlKem768;
type DecapsulationKey = <Kem as KemCore>::DecapsulationKey;

const X25519_LEN: usize = 32;

/// Which side of the handshake this synchronizer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Where a [`Synchronizer`] is in its two-stage exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizerStatus {
    Initialization,
    Synchronization,
    Success,
    Failure,
}

enum Pending {
    /// Initiator is waiting on the acceptor's ciphertext + public key.
    AwaitingCiphertext {
        decapsulation_key: DecapsulationKey,
        local_secret: EphemeralSecret,
    },
    None,
}

/// Drives one side of the hybrid handshake to completion.
///
/// # Example
///
/// ```
/// use mesh_crypto::kem::Synchronizer;
///
/// let mut initiator = Synchronizer::initiator();
/// let mut acceptor = Synchronizer::acceptor();
///
/// let stage1 = initiator.initialize().unwrap().unwrap();
/// let stage2 = acceptor.synchronize(&stage1).unwrap().unwrap();
/// assert!(initiator.synchronize(&stage2).unwrap().is_none());
///
/// let a = initiator.finalize().unwrap();
/// let b = acceptor.finalize().unwrap();
/// let ciphertext = a.encrypt(b"hello").unwrap();
/// assert_eq!(b.decrypt(&ciphertext).unwrap(), b"hello");
/// ```
pub struct Synchronizer {
    role: Role,
    status: SynchronizerStatus,
    pending: Pending,
    key_material: Option<([u8; 32], [u8; 32])>,
}

impl Synchronizer {
    pub fn initiator() -> Self {
        Self {
            role: Role::Initiator,
            status: SynchronizerStatus::Initialization,
            pending: Pending::None,
            key_material: None,
        }
    }

    pub fn acceptor() -> Self {
        Self {
            role: Role::Acceptor,
            status: SynchronizerStatus::Initialization,
            pending: Pending::None,
            key_material: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SynchronizerStatus {
        self.status
    }

    /// Number of message round trips this exchange takes: one key-exchange
    /// stage, one confirmation stage.
    pub fn stages(&self) -> u8 {
        2
    }

    /// Produces the initiator's first outbound message. Acceptors have
    /// nothing to send first and return `Ok(None)`.
    pub fn initialize(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.role {
            Role::Acceptor => Ok(None),
            Role::Initiator => {
                if self.status != SynchronizerStatus::Initialization {
                    return Err(Error::UnexpectedStage);
                }
                let mut rng = OsRng;
                let (decapsulation_key, encapsulation_key) = Kem::generate(&mut rng);
                let local_secret = EphemeralSecret::random_from_rng(&mut rng);
                let local_public = PublicKey::from(&local_secret);

                let mut message = encapsulation_key.as_bytes().to_vec();
                message.extend_from_slice(local_public.as_bytes());

                self.pending = Pending::AwaitingCiphertext {
                    decapsulation_key,
                    local_secret,
                };
                self.status = SynchronizerStatus::Synchronization;
                Ok(Some(message))
            }
        }
    }

    /// Processes an incoming handshake message. Returns the next outbound
    /// message, if this stage produces one.
    pub fn synchronize(&mut self, incoming: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match (self.role, self.status) {
            (Role::Acceptor, SynchronizerStatus::Initialization) => {
                let encapsulation_key_len = encapsulation_key_len();
                if incoming.len() != encapsulation_key_len + X25519_LEN {
                    log::warn!(
                        "acceptor got {} byte stage-one message, expected {}",
                        incoming.len(),
                        encapsulation_key_len + X25519_LEN
                    );
                    self.status = SynchronizerStatus::Failure;
                    return Err(Error::MalformedMessage);
                }
                let (ek_bytes, peer_public_bytes) = incoming.split_at(encapsulation_key_len);

                let encapsulation_key =
                    <Kem as KemCore>::EncapsulationKey::from_bytes(ek_bytes.into());

                let mut rng = OsRng;
                let (ciphertext, kem_secret) = encapsulation_key.encapsulate(&mut rng).map_err(|_| {
                    log::error!("ML-KEM encapsulation failed");
                    Error::Encapsulation
                })?;

                let local_secret = EphemeralSecret::random_from_rng(&mut rng);
                let local_public = PublicKey::from(&local_secret);
                let peer_public = decode_x25519(peer_public_bytes)?;
                let dh_secret = local_secret.diffie_hellman(&peer_public);

                self.key_material = Some(
                    derive_key_material(kem_secret.as_slice(), dh_secret.as_bytes())?,
                );
                self.status = SynchronizerStatus::Success;

                let mut message = ciphertext.to_vec();
                message.extend_from_slice(local_public.as_bytes());
                Ok(Some(message))
            }
            (Role::Initiator, SynchronizerStatus::Synchronization) => {
                let ciphertext_len = ciphertext_len();
                if incoming.len() != ciphertext_len + X25519_LEN {
                    log::warn!(
                        "initiator got {} byte stage-two message, expected {}",
                        incoming.len(),
                        ciphertext_len + X25519_LEN
                    );
                    self.status = SynchronizerStatus::Failure;
                    return Err(Error::MalformedMessage);
                }
                let (ct_bytes, peer_public_bytes) = incoming.split_at(ciphertext_len);

                let Pending::AwaitingCiphertext {
                    decapsulation_key,
                    local_secret,
                } = std::mem::replace(&mut self.pending, Pending::None)
                else {
                    self.status = SynchronizerStatus::Failure;
                    return Err(Error::UnexpectedStage);
                };

                let kem_secret = decapsulation_key.decapsulate(ct_bytes.into()).map_err(|_| {
                    log::error!("ML-KEM decapsulation failed");
                    Error::Decapsulation
                })?;

                let peer_public = decode_x25519(peer_public_bytes)?;
                let dh_secret = local_secret.diffie_hellman(&peer_public);

                self.key_material = Some(
                    derive_key_material(kem_secret.as_slice(), dh_secret.as_bytes())?,
                );
                self.status = SynchronizerStatus::Success;
                Ok(None)
            }
            _ => Err(Error::UnexpectedStage),
        }
    }

    /// Consumes the synchronizer once `status()` is `Success`, producing the
    /// symmetric key material for the session.
    pub fn finalize(self) -> Result<CipherPackage, Error> {
        match self.key_material {
            Some((enc_key, mac_key)) if self.status == SynchronizerStatus::Success => {
                Ok(CipherPackage::new(enc_key, mac_key))
            }
            _ => Err(Error::NotReady),
        }
    }
}

fn encapsulation_key_len() -> usize {
    <Kem as KemCore>::EncapsulationKey::from_bytes(&[0u8; 1184].into())
        .as_bytes()
        .len()
}

fn ciphertext_len() -> usize {
    1088
}

fn decode_x25519(bytes: &[u8]) -> Result<PublicKey, Error> {
    let array: [u8; X25519_LEN] = bytes.try_into().map_err(|_| Error::MalformedMessage)?;
    Ok(PublicKey::from(array))
}

fn derive_key_material(kem_secret: &[u8], dh_secret: &[u8]) -> Result<([u8; 32], [u8; 32]), Error> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(kem_secret.len() + dh_secret.len()));
    ikm.extend_from_slice(kem_secret);
    ikm.extend_from_slice(dh_secret);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(b"mesh-node/handshake/v1", &mut *okm)
        .map_err(|_| Error::KeyDerivation)?;

    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    Ok((enc_key, mac_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_produces_matching_cipher_packages() {
        let mut initiator = Synchronizer::initiator();
        let mut acceptor = Synchronizer::acceptor();

        let stage1 = initiator.initialize().unwrap().unwrap();
        assert_eq!(initiator.status(), SynchronizerStatus::Synchronization);

        let stage2 = acceptor.synchronize(&stage1).unwrap().unwrap();
        assert_eq!(acceptor.status(), SynchronizerStatus::Success);

        assert!(initiator.synchronize(&stage2).unwrap().is_none());
        assert_eq!(initiator.status(), SynchronizerStatus::Success);

        let a = initiator.finalize().unwrap();
        let b = acceptor.finalize().unwrap();

        let ciphertext = a.encrypt(b"hybrid handshake").unwrap();
        assert_eq!(b.decrypt(&ciphertext).unwrap(), b"hybrid handshake");
    }

    #[test]
    fn acceptor_rejects_malformed_stage_one() {
        let mut acceptor = Synchronizer::acceptor();
        assert!(acceptor.synchronize(&[0u8; 4]).is_err());
        assert_eq!(acceptor.status(), SynchronizerStatus::Failure);
    }

    #[test]
    fn finalize_before_success_fails() {
        let initiator = Synchronizer::initiator();
        assert!(initiator.finalize().is_err());
    }
}
