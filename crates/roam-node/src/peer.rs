use std::collections::HashMap;

use async_trait::async_trait;
use roam_domain::{
    ResourcesUsage, SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
};
use roam_store::{CommandError, LastVisitedNotifier, SessionDataStream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer request failed: {0}")]
    Request(String),

    #[error("peer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("peer response decode: {0}")]
    Decode(String),
}

/// Inter-node transport. One concrete binding is HTTP; any RPC that can
/// carry a byte stream works.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask `host` to offload `session_id` to `to_host`. Returns the id the
    /// session got at its destination.
    async fn issue_offload(
        &self,
        host: &str,
        session_id: &SessionId,
        to_host: &str,
    ) -> Result<SessionId, PeerError>;

    /// Stream a session into `host`. Returns where it now lives.
    async fn issue_onload(
        &self,
        host: &str,
        offloaded_from: &SessionLocation,
        metadata: &SessionMetadata,
        body: SessionDataStream,
    ) -> Result<SessionLocation, PeerError>;

    /// Hop a stale forwarding pointer on its holder. Returns whether a
    /// client has already been redirected through it.
    async fn issue_confirm_offload(
        &self,
        last_visited: &SessionLocation,
        new_location: &SessionLocation,
    ) -> Result<bool, PeerError>;

    /// Ask the lookup node at `host` to rank offload targets for sessions
    /// held by `node_id`.
    async fn issue_best_offload_targets(
        &self,
        host: &str,
        node_id: &str,
        sessions: &HashMap<SessionId, SessionInfoForOffloadDecision>,
    ) -> Result<Vec<(SessionId, String)>, PeerError>;

    /// Push this node's aggregate status to its parent at `host`.
    async fn issue_status_update(
        &self,
        host: &str,
        sessions: u64,
        usage_by_host: &HashMap<String, ResourcesUsage>,
    ) -> Result<(), PeerError>;
}

/// Adapter that lets the storage layer's commit phase hop forwarding
/// pointers over the peer transport.
pub struct PeerLastVisitedNotifier<'a> {
    pub peer: &'a dyn PeerClient,
}

#[async_trait]
impl LastVisitedNotifier for PeerLastVisitedNotifier<'_> {
    async fn notify(
        &self,
        last_visited: SessionLocation,
        new_location: SessionLocation,
    ) -> Result<bool, CommandError> {
        self.peer
            .issue_confirm_offload(&last_visited, &new_location)
            .await
            .map_err(|error| CommandError::Internal(error.to_string()))
    }
}
