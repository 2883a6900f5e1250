use roam_domain::SessionLocation;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session on its current node.
///
/// Transitions:
///   Live → Offloading   (offload start, acquisition rules permitting)
///   Offloading → Live   (offload aborted)
///   Offloading → Offloaded (offload confirmed; forwarding pointer installed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Owned here; may be acquired and, acquisition rules permitting,
    /// offloaded.
    Live,
    /// Outbound handoff in progress. Not freshly acquirable unless the
    /// caller opted into read-during-offload.
    Offloading,
    /// Moved away. Kept only as a last-visited pointer so straggling
    /// clients can be redirected.
    Offloaded { forwarded_to: SessionLocation },
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Live)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Live => write!(f, "live"),
            SessionStatus::Offloading => write!(f, "offloading"),
            SessionStatus::Offloaded { forwarded_to } => {
                write!(f, "offloaded to {}@{}", forwarded_to.session_id, forwarded_to.host)
            }
        }
    }
}
