use roam_store::CommandError;
use thiserror::Error;

use crate::peer::PeerError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The transfer phase of an offload failed before commit; the session
    /// was returned to its live state.
    #[error("session transfer aborted: {0}")]
    TransferAborted(String),

    /// Commit retries were exhausted. The session is left mid-offload for a
    /// reaper to reconcile.
    #[error("offload commit failed after {attempts} attempts: {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: CommandError,
    },
}
