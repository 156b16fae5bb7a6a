use thiserror::Error;

/// Media-path failures. Display strings are stable for test suites.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media packet decode failed")]
    PacketDecode,

    #[error("media kind mismatch")]
    KindMismatch,

    #[error("media key id mismatch")]
    KeyIdMismatch,

    #[error("media gap too large")]
    GapTooLarge,

    /// The sequence number is behind the receive window and its key was
    /// already evicted or consumed.
    #[error("media message expired")]
    Expired,

    #[error("media decrypt failed")]
    DecryptFailed,

    #[error("media frame decode failed")]
    FrameDecode,

    #[error("media frame encode failed")]
    FrameEncode,

    #[error("media kdf failed")]
    Kdf,

    #[error("media session not ready")]
    NotReady,

    #[error("peer username empty")]
    PeerEmpty,

    #[error("group id empty")]
    GroupEmpty,

    #[error("call id empty")]
    CallIdEmpty,

    #[error("key id invalid")]
    KeyIdInvalid,

    #[error("call key missing")]
    CallKeyMissing,

    #[error("media payload empty")]
    PayloadEmpty,

    /// Collaborator (relay / key service) failure, message passed through.
    #[error("{0}")]
    Transport(String),
}
