use thiserror::Error;

/// Primitive-layer failures.
///
/// Display strings are stable; upper layers forward them verbatim so test
/// suites can match on them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("rng failed")]
    Rng,

    #[error("hkdf failed")]
    Hkdf,

    #[error("aead encrypt failed")]
    AeadEncrypt,

    /// Authentication tag mismatch. Deliberately indistinguishable from
    /// wrong-key, replay outside the window, or truncation.
    #[error("auth failed")]
    AuthFailed,

    #[error("mlkem keypair failed")]
    KemKeypair,

    #[error("mlkem encaps failed")]
    KemEncaps,

    #[error("mlkem decaps failed")]
    KemDecaps,

    #[error("mldsa keypair failed")]
    SigKeypair,

    #[error("mldsa sign failed")]
    SigSign,

    #[error("signature invalid")]
    SigVerify,

    #[error("invalid key material")]
    InvalidKey,
}
