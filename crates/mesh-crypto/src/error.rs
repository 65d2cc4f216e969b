use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("synchronizer received a message for a stage it is not expecting")]
    UnexpectedStage,
    #[error("synchronizer has already reached a terminal status")]
    AlreadyFinalized,
    #[error("synchronizer has not reached Success yet")]
    NotReady,
    #[error("malformed key exchange message")]
    MalformedMessage,
    #[error("ML-KEM encapsulation failed")]
    Encapsulation,
    #[error("ML-KEM decapsulation failed")]
    Decapsulation,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("AEAD encryption failed")]
    Encrypt,
    #[error("AEAD decryption failed (ciphertext forged or corrupted)")]
    Decrypt,
    #[error("message authentication code did not verify")]
    SignatureMismatch,
}
