use roam_domain::{SessionId, SessionLocation};
use roam_infra::GeoCoordinates;

/// How a session is acquired.
#[derive(Debug, Clone, Default)]
pub struct AcquireSessionOptions {
    /// Leave the session eligible for offloading while this acquisition is
    /// held.
    pub allow_offloading: bool,
    /// Acquire even while the session is offloading. The caller commits to
    /// read-only use; the store does not enforce it.
    pub allow_while_offloading: bool,
}

/// How a session is created.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Position of the owning client. Absent means "approximate with the
    /// creating node's own position".
    pub client_geo_coordinates: Option<GeoCoordinates>,
    /// Unix seconds UTC. Absent means the session does not expire.
    pub expires_at: Option<i64>,
    /// Explicit id instead of a generated one.
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateAndAcquireSessionOptions {
    pub create: CreateSessionOptions,
    pub acquire: AcquireSessionOptions,
}

#[derive(Debug, Clone, Default)]
pub struct OffloadSessionOptions {
    /// Start the offload even while acquisitions that block offloading are
    /// in flight.
    pub allow_while_acquired: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OnloadSessionOptions {
    /// Keep this id instead of generating a fresh one.
    pub session_id: Option<SessionId>,
    /// Where the session lived before the transfer. Recorded as the
    /// last-visited pointer that the commit phase notifies.
    pub offloaded_from: Option<SessionLocation>,
}

/// Metadata mutation. `expired` wins over `expires_at`.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadataOptions {
    pub client_geo_coordinates: Option<GeoCoordinates>,
    pub expires_at: Option<i64>,
    pub expired: bool,
}

#[derive(Debug, Clone)]
pub struct BestOffloadTargetsOptions {
    /// Upper bound on the sessions the local selector proposes.
    pub max_sessions: usize,
    /// Fallback targets emitted per session, best first.
    pub max_targets_per_session: usize,
}

impl Default for BestOffloadTargetsOptions {
    fn default() -> Self {
        BestOffloadTargetsOptions { max_sessions: 10, max_targets_per_session: 3 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GarbageCollectSessionsOptions {
    /// Also collect expired sessions that still hold acquisitions, once they
    /// have been idle for this many seconds.
    pub expired_unreleased_older_than: Option<i64>,
}
