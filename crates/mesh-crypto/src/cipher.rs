//! The symmetric package produced once a [`crate::kem::Synchronizer`]
//! reaches `Success`: AEAD encrypt/decrypt plus a separate MAC for traffic
//! that must stay in the clear but still be authenticated.

use crate::error::Error;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric key material derived from a completed handshake. Both keys are
/// wiped on drop.
pub struct CipherPackage {
    enc_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl CipherPackage {
    pub fn new(enc_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self {
            enc_key: Zeroizing::new(enc_key),
            mac_key: Zeroizing::new(mac_key),
        }
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.enc_key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.append(&mut sealed);
        Ok(out)
    }

    /// Decrypts a `nonce || ciphertext || tag` buffer produced by
    /// [`Self::encrypt`]. A failed AEAD tag check doubles as the "does this
    /// verify" answer — there is no separate `verify()` for encrypted data.
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>, Error> {
        if framed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decrypt);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.enc_key));
        cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext).map_err(|_| {
            log::debug!("AEAD tag check failed on a {} byte frame", framed.len());
            Error::Decrypt
        })
    }

    /// HMAC-SHA256 over `data`, keyed from the synchronizer's second HKDF
    /// output. Used for handshake-adjacent traffic that must stay readable
    /// but still be authenticated.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = HmacSha256::new_from_slice(&*self.mac_key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Error> {
        let mut mac = HmacSha256::new_from_slice(&*self.mac_key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| Error::SignatureMismatch)
    }

    pub fn encrypted_size(plaintext_len: usize) -> usize {
        NONCE_LEN + plaintext_len + TAG_LEN
    }

    pub fn signature_size() -> usize {
        SIGNATURE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> CipherPackage {
        CipherPackage::new([1u8; 32], [2u8; 32])
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let package = package();
        let ciphertext = package.encrypt(b"hello mesh").unwrap();
        assert_eq!(ciphertext.len(), CipherPackage::encrypted_size(b"hello mesh".len()));
        let plaintext = package.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"hello mesh");
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let package = package();
        let mut ciphertext = package.encrypt(b"hello mesh").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(package.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn sign_verify_round_trips() {
        let package = package();
        let signature = package.sign(b"route-announce");
        assert_eq!(signature.len(), CipherPackage::signature_size());
        assert!(package.verify(b"route-announce", &signature).is_ok());
        assert!(package.verify(b"tampered", &signature).is_err());
    }
}
