use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use futures::future::BoxFuture;
use roam_domain::{
    ResourcesUsage, SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
};
use roam_infra::Node;

use crate::error::CommandError;
use crate::options::{
    AcquireSessionOptions, BestOffloadTargetsOptions, CreateAndAcquireSessionOptions,
    CreateSessionOptions, GarbageCollectSessionsOptions, OffloadSessionOptions,
    OnloadSessionOptions, SessionMetadataOptions,
};

/// Consumer end of a streaming session transfer.
pub type SessionDataStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Producer side of a streaming session transfer. Must be scheduled
/// concurrently with reads from the matching [`SessionDataStream`]; a
/// producer failure surfaces as a read error on the stream.
pub type SessionDataLoader = BoxFuture<'static, io::Result<()>>;

/// Sink for the commit-phase forwarding-pointer hop: tells a node that still
/// holds a stale pointer for a session where the session lives now.
#[async_trait]
pub trait LastVisitedNotifier: Send + Sync {
    /// Returns whether a client has already been redirected through the
    /// updated pointer during this window.
    async fn notify(
        &self,
        last_visited: SessionLocation,
        new_location: SessionLocation,
    ) -> Result<bool, CommandError>;
}

// ── Acquire / release ─────────────────────────────────────────────────────────

#[async_trait]
pub trait AcquireSessionCommands: Send + Sync {
    /// Acquire a session. Returns the forwarding location iff the session
    /// has been offloaded from this node; `None` means the caller is now a
    /// registered holder and must release exactly once.
    ///
    /// Errors: `SessionNotFound`, `SessionIsOffloading` (when
    /// `allow_while_offloading` is off).
    async fn acquire_session(
        &self,
        session_id: &SessionId,
        opt: &AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>, CommandError>;

    /// Release a previously acquired session. Pass the same options the
    /// acquisition used.
    ///
    /// Errors: `SessionNotFound`, `NoAcquisitionToRelease`.
    async fn release_session(
        &self,
        session_id: &SessionId,
        opt: &AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>, CommandError>;

    /// Page through sessions currently eligible for offloading. `None`
    /// cursor starts a scan; `None` next-cursor ends it.
    async fn scan_offloadable_sessions(
        &self,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Vec<SessionId>, Option<String>), CommandError>;
}

// ── Create ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CreateSessionCommands: Send + Sync {
    /// Errors: `SessionIdAlreadyExists` when `opt.session_id` collides.
    async fn create_session(&self, opt: &CreateSessionOptions)
        -> Result<SessionId, CommandError>;

    /// Create and atomically acquire in one step.
    async fn create_and_acquire_session(
        &self,
        opt: &CreateAndAcquireSessionOptions,
    ) -> Result<SessionId, CommandError>;

    async fn scan_sessions(
        &self,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Vec<SessionId>, Option<String>), CommandError>;
}

// ── Metadata ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionMetadataCommands: Send + Sync {
    async fn get_session_metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionMetadata, CommandError>;

    async fn set_session_metadata(
        &self,
        session_id: &SessionId,
        opt: &SessionMetadataOptions,
    ) -> Result<(), CommandError>;
}

// ── Offload lifecycle ─────────────────────────────────────────────────────────

#[async_trait]
pub trait OffloadSessionCommands: SessionMetadataCommands {
    /// Atomically transition `Live → Offloading` and open a stream over the
    /// session's serialized key space. The loader, when present, must be
    /// scheduled concurrently by the caller; it pumps the stream and
    /// terminates.
    ///
    /// Errors: `SessionNotFound`, `SessionIsOffloading`,
    /// `UnableToOffloadAcquiredSession`.
    async fn offload_session(
        &self,
        session_id: &SessionId,
        opt: &OffloadSessionOptions,
    ) -> Result<(SessionDataStream, Option<SessionDataLoader>), CommandError>;

    /// Transition `Offloading → Offloaded`, install the forwarding pointer
    /// and hop any stale pointer through `notify_last_visited`. Idempotent:
    /// a retried commit overwrites the pointer and notifies again.
    async fn confirm_session_offload(
        &self,
        session_id: &SessionId,
        new_location: SessionLocation,
        opt: &OffloadSessionOptions,
        notify_last_visited: &dyn LastVisitedNotifier,
    ) -> Result<(), CommandError>;

    /// Transition `Offloading → Live` after a failed transfer. No-op on a
    /// session that is still `Live`.
    async fn abort_session_offload(&self, session_id: &SessionId) -> Result<(), CommandError>;

    /// Overwrite the local forwarding pointer with the freshest known
    /// location. Returns whether a client has already been redirected
    /// through this node since the session left.
    async fn update_offloaded_session_location(
        &self,
        session_id: &SessionId,
        new_location: SessionLocation,
    ) -> Result<bool, CommandError>;
}

// ── Onload ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait OnloadSessionCommands: Send + Sync {
    /// Write an inbound session transfer into local storage and return its
    /// id here. A stream failure rolls the partial session back and
    /// surfaces as an error.
    ///
    /// Errors: `SessionAlreadyOnloaded` when the implied id is taken.
    async fn onload_session(
        &self,
        metadata: SessionMetadata,
        reader: SessionDataStream,
        opt: &OnloadSessionOptions,
    ) -> Result<SessionId, CommandError>;
}

// ── Resource usage ────────────────────────────────────────────────────────────

#[async_trait]
pub trait ResourcesUsageCommands: Send + Sync {
    async fn get_session_resources_usage(
        &self,
        session_id: &SessionId,
    ) -> Result<ResourcesUsage, CommandError>;

    /// Active session count and usage for a host this node knows about
    /// (itself, or anything reported by a child).
    async fn get_node_resources_usage(
        &self,
        host: &str,
    ) -> Result<(u64, ResourcesUsage), CommandError>;

    /// Update a session's usage; the node aggregate follows.
    async fn update_session_resources_usage(
        &self,
        session_id: &SessionId,
        usage: ResourcesUsage,
    ) -> Result<(), CommandError>;

    /// The payload to push upstream: total known sessions and the flattened
    /// per-host usage map, own host included.
    async fn resources_usage_update_to_parent(
        &self,
    ) -> Result<(u64, HashMap<String, ResourcesUsage>), CommandError>;

    /// Merge a child's push. Per-host entries overwrite; stale packets may
    /// briefly regress a reading and are corrected by the next push.
    async fn resources_usage_update_from_child(
        &self,
        sessions: u64,
        usage_by_host: HashMap<String, ResourcesUsage>,
    ) -> Result<(), CommandError>;

    /// `Some(host)` when this node should shed a new client to a peer with
    /// more headroom.
    async fn redirect_new_requests(&self) -> Result<Option<String>, CommandError>;
}

// ── Target selection ──────────────────────────────────────────────────────────

#[async_trait]
pub trait BestOffloadTargetsCommands: Send + Sync {
    /// Sessions this node would rather not keep, ranked by cost (footprint,
    /// inactivity, distance from client), up to `max_sessions`.
    async fn best_sessions_to_offload(
        &self,
        opt: &BestOffloadTargetsOptions,
    ) -> Result<HashMap<SessionId, SessionInfoForOffloadDecision>, CommandError>;

    /// Ordered `(session, host)` pairs. Sessions and hosts may repeat to
    /// encode fallback order; the list is deterministic for equal inputs.
    async fn best_offload_target_nodes(
        &self,
        from_host: &str,
        sessions: HashMap<SessionId, SessionInfoForOffloadDecision>,
        opt: &BestOffloadTargetsOptions,
    ) -> Result<Vec<(SessionId, String)>, CommandError>;

    /// The node holding the authoritative target-selection view for these
    /// sessions, typically a shared ancestor area.
    async fn find_lookup_node(&self, session_ids: &[SessionId]) -> Result<Node, CommandError>;
}

// ── Garbage collection ────────────────────────────────────────────────────────

#[async_trait]
pub trait GarbageCollectSessionsCommands: Send + Sync {
    /// Sweep one batch of expired sessions and reclaimed forwarding
    /// entries. `None` cursor starts the sweep; `None` next-cursor ends it.
    async fn garbage_collect_sessions(
        &self,
        opt: &GarbageCollectSessionsOptions,
        cursor: Option<&str>,
    ) -> Result<Option<String>, CommandError>;
}

/// The full capability set the core requires from its storage layer.
pub trait Commands:
    AcquireSessionCommands
    + CreateSessionCommands
    + SessionMetadataCommands
    + OffloadSessionCommands
    + OnloadSessionCommands
    + ResourcesUsageCommands
    + BestOffloadTargetsCommands
    + GarbageCollectSessionsCommands
{
}

impl<T> Commands for T where
    T: AcquireSessionCommands
        + CreateSessionCommands
        + SessionMetadataCommands
        + OffloadSessionCommands
        + OnloadSessionCommands
        + ResourcesUsageCommands
        + BestOffloadTargetsCommands
        + GarbageCollectSessionsCommands
{
}
