use thiserror::Error;

#[derive(Debug, Error)]
pub enum KtError {
    #[error("kt log path empty")]
    PathEmpty,

    #[error("open kt log failed")]
    Open,

    #[error("kt log magic mismatch")]
    MagicMismatch,

    #[error("kt log username length invalid")]
    UsernameLengthInvalid,

    #[error("username empty")]
    UsernameEmpty,

    #[error("username too long")]
    UsernameTooLong,

    #[error("kt entry not found")]
    EntryNotFound,

    #[error("kt empty")]
    Empty,

    #[error("invalid sizes")]
    InvalidSizes,

    #[error("new size beyond head")]
    SizeBeyondHead,

    #[error("open kt log for append failed")]
    OpenAppend,

    #[error("write kt log failed")]
    Write,
}
