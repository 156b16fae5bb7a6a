use thiserror::Error;

use mi_crypto::CryptoError;

/// Engine failures. Display strings are stable: user-facing layers
/// localize at the UI boundary and test suites match on them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("state_dir empty")]
    StateDirEmpty,

    #[error("identity truncated")]
    IdentityTruncated,

    #[error("identity size invalid")]
    IdentitySizeInvalid,

    #[error("identity version mismatch")]
    IdentityVersionMismatch,

    #[error("identity unprotect failed")]
    IdentityUnprotectFailed,

    #[error("identity wrap failed")]
    IdentityWrapFailed,

    #[error("keystore unavailable")]
    KeystoreUnavailable,

    #[error("bundle size invalid")]
    BundleSizeInvalid,

    #[error("bundle version mismatch")]
    BundleVersionMismatch,

    #[error("bundle signature invalid")]
    BundleSignatureInvalid,

    #[error("peer not trusted")]
    PeerNotTrusted,

    #[error("peer fingerprint changed")]
    PeerFingerprintChanged,

    #[error("no pending peer trust")]
    NoPendingPeerTrust,

    #[error("sas mismatch")]
    SasMismatch,

    #[error("no send chain")]
    NoSendChain,

    #[error("no recv chain")]
    NoRecvChain,

    #[error("too many skipped")]
    TooManySkipped,

    #[error("replayed or too old")]
    ReplayedOrTooOld,

    #[error("ratchet header invalid")]
    RatchetHeaderInvalid,

    #[error("ratchet pn invalid")]
    RatchetPnInvalid,

    #[error("ratchet state invalid")]
    RatchetStateInvalid,

    #[error("prekey signature invalid")]
    PrekeySignatureInvalid,

    #[error("unknown message type")]
    UnknownMessageType,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("payload too short")]
    PayloadTooShort,

    #[error("prekey payload truncated")]
    PrekeyPayloadTruncated,

    #[error("ratchet payload truncated")]
    RatchetPayloadTruncated,

    #[error("no session")]
    NoSession,

    #[error("spk_id mismatch")]
    SpkIdMismatch,

    #[error("peer empty")]
    PeerEmpty,

    #[error("plaintext empty")]
    PlaintextEmpty,

    #[error("peer bundle missing")]
    PeerBundleMissing,

    #[error("message empty")]
    MessageEmpty,

    #[error("signature size invalid")]
    SignatureSizeInvalid,

    #[error("public key size invalid")]
    PublicKeySizeInvalid,

    /// Filesystem / trust-store persistence failure.
    #[error("{0}")]
    Storage(String),
}
