use thiserror::Error;

use duolog_shared::RepositoryError;

/// The request is not allowed in the caller's current state. Nothing was
/// changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("Already waiting for a partner")]
    AlreadyQueued,

    #[error("Already in a chat")]
    AlreadyInSession,

    #[error("User is banned")]
    Banned,

    #[error("Not in an active chat")]
    NoActiveSession,

    #[error("Partner does not accept files")]
    FilesNotAllowed,

    #[error("Message has no content")]
    EmptyContent,

    #[error("User is not registered")]
    NotRegistered,

    #[error("User is already registered")]
    AlreadyRegistered,

    #[error("Unknown anonymous id")]
    UnknownAnonId,
}

/// A gate token could not be redeemed. The gate is presented again on the
/// next search.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token not found")]
    TokenNotFound,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token already used")]
    TokenAlreadyUsed,

    #[error("Too soon, wait {remaining_secs} more seconds")]
    TooSoon { remaining_secs: i64 },

    #[error("Token belongs to another user")]
    NotTokenOwner,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The peer's transport rejected the delivery; the session was closed.
    #[error("Partner is unreachable")]
    PeerUnreachable,

    /// Storage failed; the operation was aborted without side effects.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CoreError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Repository(RepositoryError::Unavailable(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
