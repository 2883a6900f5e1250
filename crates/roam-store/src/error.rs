use roam_domain::SessionId;
use thiserror::Error;

/// Errors the session capability surface can return.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session is mid-offload and the acquisition did not opt into
    /// read-during-offload.
    #[error("session is offloading: {0}")]
    SessionIsOffloading(SessionId),

    #[error("session already onloaded: {0}")]
    SessionAlreadyOnloaded(SessionId),

    #[error("session id already exists: {0}")]
    SessionIdAlreadyExists(SessionId),

    /// Release without a matching acquire. A programming error on the
    /// caller's side; surfaced and logged, never swallowed silently.
    #[error("no acquisition to release: {0}")]
    NoAcquisitionToRelease(SessionId),

    /// The target selector must skip this session.
    #[error("unable to offload acquired session: {0}")]
    UnableToOffloadAcquiredSession(SessionId),

    #[error("invalid scan cursor: {0}")]
    InvalidCursor(String),

    #[error("invalid scan count: {0}")]
    InvalidCount(usize),

    #[error("session data stream: {0}")]
    SessionData(#[from] std::io::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
