use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use roam_domain::{
    ResourcesUsage, SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
};
use roam_infra::{GeoCoordinates, Infrastructure, Node, Resources, UNLIMITED_CAPACITY};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::commands::{
    AcquireSessionCommands, BestOffloadTargetsCommands, CreateSessionCommands,
    GarbageCollectSessionsCommands, LastVisitedNotifier, OffloadSessionCommands,
    OnloadSessionCommands, ResourcesUsageCommands, SessionDataLoader, SessionDataStream,
    SessionMetadataCommands,
};
use crate::error::CommandError;
use crate::options::{
    AcquireSessionOptions, BestOffloadTargetsOptions, CreateAndAcquireSessionOptions,
    CreateSessionOptions, GarbageCollectSessionsOptions, OffloadSessionOptions,
    OnloadSessionOptions, SessionMetadataOptions,
};
use crate::state::SessionStatus;

const STREAM_CHUNK: usize = 64 * 1024;
const GC_BATCH: usize = 64;

/// A node sheds new clients once its tightest headroom index drops below
/// this (usage at or above capacity).
const OVERLOAD_HEADROOM: f64 = 1.0;

#[derive(Debug)]
struct SessionRecord {
    metadata: SessionMetadata,
    /// The serialized key space. The real storage engine streams this; the
    /// reference implementation holds it whole.
    data: Vec<u8>,
    usage: ResourcesUsage,
    status: SessionStatus,
    /// In-flight acquisitions.
    acquisitions: u32,
    /// Acquisitions that did not opt into `allow_offloading`.
    offload_blockers: u32,
    /// Where the session lived before it was onloaded here, if anywhere.
    last_visited: Option<SessionLocation>,
    /// A client has been redirected through the forwarding pointer since
    /// the session left this node.
    client_redirected: bool,
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<SessionId, SessionRecord>,
    own_usage: ResourcesUsage,
    child_usage: HashMap<String, ResourcesUsage>,
    child_sessions: HashMap<String, u64>,
    infrastructure: Arc<Infrastructure>,
}

/// In-memory implementation of the session capability surface.
///
/// All data is lost on process exit. Backs tests and single-process
/// deployments; a persistent engine implements the same traits.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    host: String,
    inner: Arc<RwLock<Inner>>,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Tightest `capacity / usage` ratio across the declared resources.
/// Unlimited capacities and idle resources do not constrain headroom.
fn min_headroom(resources: &Resources, usage: &ResourcesUsage) -> f64 {
    let mut min = f64::INFINITY;
    for (resource, capacity) in resources {
        if *capacity == UNLIMITED_CAPACITY {
            continue;
        }
        let used = usage.get(resource).copied().unwrap_or(0.0);
        if used <= 0.0 {
            continue;
        }
        let index = capacity / used;
        if index < min {
            min = index;
        }
    }
    min
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, CommandError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| CommandError::InvalidCursor(raw.to_string())),
    }
}

fn page(ids: Vec<SessionId>, start: usize, count: usize) -> (Vec<SessionId>, Option<String>) {
    let end = (start + count).min(ids.len());
    let next = if end < ids.len() { Some(end.to_string()) } else { None };
    let page = ids.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
    (page, next)
}

impl Inner {
    fn record(&self, session_id: &SessionId) -> Result<&SessionRecord, CommandError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| CommandError::SessionNotFound(session_id.clone()))
    }

    fn record_mut(&mut self, session_id: &SessionId) -> Result<&mut SessionRecord, CommandError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| CommandError::SessionNotFound(session_id.clone()))
    }

    fn self_node(&self, host: &str) -> Option<Node> {
        self.infrastructure.node_by_host(host).cloned()
    }

    fn live_count(&self) -> u64 {
        self.sessions
            .values()
            .filter(|record| record.status.is_live())
            .count() as u64
    }

    fn sorted_ids<F>(&self, filter: F) -> Vec<SessionId>
    where
        F: Fn(&SessionRecord) -> bool,
    {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, record)| filter(record))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn recompute_own_usage(&mut self) {
        let mut aggregate = ResourcesUsage::new();
        for record in self.sessions.values() {
            if matches!(record.status, SessionStatus::Offloaded { .. }) {
                continue;
            }
            for (resource, value) in &record.usage {
                *aggregate.entry(resource.clone()).or_insert(0.0) += value;
            }
        }
        self.own_usage = aggregate;
    }

    /// Usage this node knows for `host`: its own measurement or the latest
    /// child report.
    fn known_usage(&self, self_host: &str, host: &str) -> Option<&ResourcesUsage> {
        if host == self_host {
            Some(&self.own_usage)
        } else {
            self.child_usage.get(host)
        }
    }
}

impl InMemoryStore {
    pub fn new(host: impl Into<String>, infrastructure: Arc<Infrastructure>) -> Self {
        InMemoryStore {
            host: host.into(),
            inner: Arc::new(RwLock::new(Inner {
                sessions: HashMap::new(),
                own_usage: ResourcesUsage::new(),
                child_usage: HashMap::new(),
                child_sessions: HashMap::new(),
                infrastructure,
            })),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Replace the topology snapshot. Atomic with respect to every other
    /// operation.
    pub async fn reload_infrastructure(&self, infrastructure: Arc<Infrastructure>) {
        self.inner.write().await.infrastructure = infrastructure;
    }

    /// Read a session's key-space bytes. Stand-in for the storage engine's
    /// data plane; handlers of the real system go through the engine
    /// directly.
    pub async fn session_data(&self, session_id: &SessionId) -> Result<Vec<u8>, CommandError> {
        let inner = self.inner.read().await;
        Ok(inner.record(session_id)?.data.clone())
    }

    /// Overwrite a session's key-space bytes. See [`Self::session_data`].
    pub async fn set_session_data(
        &self,
        session_id: &SessionId,
        data: Vec<u8>,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        record.data = data;
        record.metadata.updated_at = now();
        Ok(())
    }

    pub async fn session_status(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionStatus, CommandError> {
        let inner = self.inner.read().await;
        Ok(inner.record(session_id)?.status.clone())
    }

    fn new_record(&self, inner: &Inner, opt: &CreateSessionOptions) -> SessionRecord {
        let created_at = now();
        let client_geo_coordinates = opt.client_geo_coordinates.or_else(|| {
            inner
                .self_node(&self.host)
                .map(|node| node.geo_coordinates)
        });
        SessionRecord {
            metadata: SessionMetadata {
                client_geo_coordinates,
                created_in: self.host.clone(),
                created_at,
                updated_at: created_at,
                expires_at: opt.expires_at,
            },
            data: Vec::new(),
            usage: ResourcesUsage::new(),
            status: SessionStatus::Live,
            acquisitions: 0,
            offload_blockers: 0,
            last_visited: None,
            client_redirected: false,
        }
    }

    fn insert_record(
        inner: &mut Inner,
        opt_id: Option<&SessionId>,
        record: SessionRecord,
        conflict: impl Fn(SessionId) -> CommandError,
    ) -> Result<SessionId, CommandError> {
        let session_id = opt_id
            .cloned()
            .unwrap_or_else(|| SessionId::new(Uuid::new_v4().to_string()));
        if inner.sessions.contains_key(&session_id) {
            return Err(conflict(session_id));
        }
        inner.sessions.insert(session_id.clone(), record);
        Ok(session_id)
    }

    fn register_acquisition(record: &mut SessionRecord, opt: &AcquireSessionOptions) {
        record.acquisitions += 1;
        if !opt.allow_offloading {
            record.offload_blockers += 1;
        }
        record.metadata.updated_at = now();
    }
}

// ── Acquire / release ─────────────────────────────────────────────────────────

#[async_trait]
impl AcquireSessionCommands for InMemoryStore {
    async fn acquire_session(
        &self,
        session_id: &SessionId,
        opt: &AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>, CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        match &record.status {
            SessionStatus::Offloaded { forwarded_to } => {
                let forwarded_to = forwarded_to.clone();
                record.client_redirected = true;
                Ok(Some(forwarded_to))
            }
            SessionStatus::Offloading if !opt.allow_while_offloading => {
                Err(CommandError::SessionIsOffloading(session_id.clone()))
            }
            _ => {
                Self::register_acquisition(record, opt);
                Ok(None)
            }
        }
    }

    async fn release_session(
        &self,
        session_id: &SessionId,
        opt: &AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>, CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        if let SessionStatus::Offloaded { forwarded_to } = &record.status {
            return Ok(Some(forwarded_to.clone()));
        }
        if record.acquisitions == 0 {
            return Err(CommandError::NoAcquisitionToRelease(session_id.clone()));
        }
        record.acquisitions -= 1;
        if !opt.allow_offloading {
            record.offload_blockers = record.offload_blockers.saturating_sub(1);
        }
        Ok(None)
    }

    async fn scan_offloadable_sessions(
        &self,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Vec<SessionId>, Option<String>), CommandError> {
        if count == 0 {
            return Err(CommandError::InvalidCount(count));
        }
        let start = parse_cursor(cursor)?;
        let inner = self.inner.read().await;
        let ids = inner
            .sorted_ids(|record| record.status.is_live() && record.offload_blockers == 0);
        Ok(page(ids, start, count))
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

#[async_trait]
impl CreateSessionCommands for InMemoryStore {
    async fn create_session(
        &self,
        opt: &CreateSessionOptions,
    ) -> Result<SessionId, CommandError> {
        let mut inner = self.inner.write().await;
        let record = self.new_record(&inner, opt);
        Self::insert_record(
            &mut inner,
            opt.session_id.as_ref(),
            record,
            CommandError::SessionIdAlreadyExists,
        )
    }

    async fn create_and_acquire_session(
        &self,
        opt: &CreateAndAcquireSessionOptions,
    ) -> Result<SessionId, CommandError> {
        let mut inner = self.inner.write().await;
        let mut record = self.new_record(&inner, &opt.create);
        Self::register_acquisition(&mut record, &opt.acquire);
        Self::insert_record(
            &mut inner,
            opt.create.session_id.as_ref(),
            record,
            CommandError::SessionIdAlreadyExists,
        )
    }

    async fn scan_sessions(
        &self,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Vec<SessionId>, Option<String>), CommandError> {
        if count == 0 {
            return Err(CommandError::InvalidCount(count));
        }
        let start = parse_cursor(cursor)?;
        let inner = self.inner.read().await;
        let ids = inner.sorted_ids(|_| true);
        Ok(page(ids, start, count))
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

#[async_trait]
impl SessionMetadataCommands for InMemoryStore {
    async fn get_session_metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionMetadata, CommandError> {
        let inner = self.inner.read().await;
        Ok(inner.record(session_id)?.metadata.clone())
    }

    async fn set_session_metadata(
        &self,
        session_id: &SessionId,
        opt: &SessionMetadataOptions,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        if let Some(coordinates) = opt.client_geo_coordinates {
            record.metadata.client_geo_coordinates = Some(coordinates);
        }
        if opt.expired {
            record.metadata.expires_at = Some(now());
        } else if let Some(expires_at) = opt.expires_at {
            record.metadata.expires_at = Some(expires_at);
        }
        record.metadata.updated_at = now();
        Ok(())
    }
}

// ── Offload lifecycle ─────────────────────────────────────────────────────────

#[async_trait]
impl OffloadSessionCommands for InMemoryStore {
    async fn offload_session(
        &self,
        session_id: &SessionId,
        opt: &OffloadSessionOptions,
    ) -> Result<(SessionDataStream, Option<SessionDataLoader>), CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        match record.status {
            SessionStatus::Live => {}
            SessionStatus::Offloading => {
                return Err(CommandError::SessionIsOffloading(session_id.clone()))
            }
            SessionStatus::Offloaded { .. } => {
                return Err(CommandError::SessionNotFound(session_id.clone()))
            }
        }
        if record.offload_blockers > 0 && !opt.allow_while_acquired {
            return Err(CommandError::UnableToOffloadAcquiredSession(session_id.clone()));
        }

        record.status = SessionStatus::Offloading;
        let mut snapshot = Bytes::from(record.data.clone());

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
        let reader = StreamReader::new(ReceiverStream::new(rx));
        let loader: SessionDataLoader = async move {
            while !snapshot.is_empty() {
                let chunk = snapshot.split_to(STREAM_CHUNK.min(snapshot.len()));
                // Receiver dropped means the transfer was torn down; stop.
                if tx.send(Ok(chunk)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        .boxed();

        Ok((Box::new(reader), Some(loader)))
    }

    async fn confirm_session_offload(
        &self,
        session_id: &SessionId,
        new_location: SessionLocation,
        _opt: &OffloadSessionOptions,
        notify_last_visited: &dyn LastVisitedNotifier,
    ) -> Result<(), CommandError> {
        // Hop any stale pointer before flipping state: a failed hop leaves
        // the session mid-offload so a commit retry re-runs the whole step.
        // Pointer updates overwrite, so re-notifying is harmless.
        let last_visited = {
            let inner = self.inner.read().await;
            let record = inner.record(session_id)?;
            match record.status {
                SessionStatus::Offloading | SessionStatus::Offloaded { .. } => {}
                SessionStatus::Live => {
                    return Err(CommandError::Internal(format!(
                        "confirm of session {session_id} that is not offloading"
                    )))
                }
            }
            record.last_visited.clone()
        };
        if let Some(last_visited) = last_visited {
            let client_redirected = notify_last_visited
                .notify(last_visited, new_location.clone())
                .await?;
            debug!(
                session_id = %session_id,
                client_redirected, "forwarding pointer hopped"
            );
        }

        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        record.status = SessionStatus::Offloaded { forwarded_to: new_location };
        // The key space now lives elsewhere; only the pointer remains.
        record.data = Vec::new();
        record.usage = ResourcesUsage::new();
        inner.recompute_own_usage();
        Ok(())
    }

    async fn abort_session_offload(&self, session_id: &SessionId) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        match record.status {
            SessionStatus::Offloading => {
                record.status = SessionStatus::Live;
                Ok(())
            }
            SessionStatus::Live => Ok(()),
            SessionStatus::Offloaded { .. } => Err(CommandError::Internal(format!(
                "abort of session {session_id} that is already offloaded"
            ))),
        }
    }

    async fn update_offloaded_session_location(
        &self,
        session_id: &SessionId,
        new_location: SessionLocation,
    ) -> Result<bool, CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        match &mut record.status {
            SessionStatus::Offloaded { forwarded_to } => {
                *forwarded_to = new_location;
                Ok(record.client_redirected)
            }
            _ => Err(CommandError::SessionNotFound(session_id.clone())),
        }
    }
}

// ── Onload ────────────────────────────────────────────────────────────────────

#[async_trait]
impl OnloadSessionCommands for InMemoryStore {
    async fn onload_session(
        &self,
        metadata: SessionMetadata,
        mut reader: SessionDataStream,
        opt: &OnloadSessionOptions,
    ) -> Result<SessionId, CommandError> {
        // Drain the stream before touching the map; a stream failure leaves
        // no partial session behind.
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let mut inner = self.inner.write().await;
        let record = SessionRecord {
            metadata: SessionMetadata { updated_at: now(), ..metadata },
            data,
            usage: ResourcesUsage::new(),
            status: SessionStatus::Live,
            acquisitions: 0,
            offload_blockers: 0,
            last_visited: opt.offloaded_from.clone(),
            client_redirected: false,
        };
        Self::insert_record(
            &mut inner,
            opt.session_id.as_ref(),
            record,
            CommandError::SessionAlreadyOnloaded,
        )
    }
}

// ── Resource usage ────────────────────────────────────────────────────────────

#[async_trait]
impl ResourcesUsageCommands for InMemoryStore {
    async fn get_session_resources_usage(
        &self,
        session_id: &SessionId,
    ) -> Result<ResourcesUsage, CommandError> {
        let inner = self.inner.read().await;
        Ok(inner.record(session_id)?.usage.clone())
    }

    async fn get_node_resources_usage(
        &self,
        host: &str,
    ) -> Result<(u64, ResourcesUsage), CommandError> {
        let inner = self.inner.read().await;
        if host == self.host {
            return Ok((inner.live_count(), inner.own_usage.clone()));
        }
        let usage = inner.child_usage.get(host).cloned().unwrap_or_default();
        let sessions = inner.child_sessions.get(host).copied().unwrap_or(0);
        Ok((sessions, usage))
    }

    async fn update_session_resources_usage(
        &self,
        session_id: &SessionId,
        usage: ResourcesUsage,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(session_id)?;
        record.usage = usage;
        inner.recompute_own_usage();
        Ok(())
    }

    async fn resources_usage_update_to_parent(
        &self,
    ) -> Result<(u64, HashMap<String, ResourcesUsage>), CommandError> {
        let inner = self.inner.read().await;
        let mut usage_by_host = inner.child_usage.clone();
        usage_by_host.insert(self.host.clone(), inner.own_usage.clone());
        let sessions = inner.live_count() + inner.child_sessions.values().sum::<u64>();
        Ok((sessions, usage_by_host))
    }

    async fn resources_usage_update_from_child(
        &self,
        sessions: u64,
        usage_by_host: HashMap<String, ResourcesUsage>,
    ) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;
        // The pushing child identifies itself through the map: exactly one
        // key is a direct child of this node.
        let child_host = {
            let children = inner.infrastructure.children_of(&self.host);
            usage_by_host
                .keys()
                .find(|host| children.iter().any(|child| &child.host == *host))
                .cloned()
        };
        match child_host {
            Some(child_host) => {
                inner.child_sessions.insert(child_host, sessions);
            }
            None => warn!(host = %self.host, "status push from unknown child"),
        }
        for (host, usage) in usage_by_host {
            inner.child_usage.insert(host, usage);
        }
        Ok(())
    }

    async fn redirect_new_requests(&self) -> Result<Option<String>, CommandError> {
        let inner = self.inner.read().await;
        let Some(self_node) = inner.self_node(&self.host) else {
            return Ok(None);
        };
        let own_headroom = min_headroom(&self_node.resources, &inner.own_usage);
        if own_headroom >= OVERLOAD_HEADROOM {
            return Ok(None);
        }

        let mut candidates: Vec<(&String, f64)> = inner
            .child_usage
            .iter()
            .filter(|(host, _)| host.as_str() != self.host)
            .filter_map(|(host, usage)| {
                inner
                    .infrastructure
                    .node_by_host(host)
                    .map(|node| (host, min_headroom(&node.resources, usage)))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        Ok(candidates
            .first()
            .filter(|(_, headroom)| *headroom > own_headroom)
            .map(|(host, _)| (*host).clone()))
    }
}

// ── Target selection ──────────────────────────────────────────────────────────

/// Offload cost of keeping a session: footprint, staleness and distance to
/// its client all raise it.
fn session_cost(record: &SessionRecord, node_geo: Option<GeoCoordinates>, now: i64) -> f64 {
    let footprint: f64 = record.usage.values().sum();
    let staleness = (now - record.metadata.updated_at).max(0) as f64 / 60.0;
    let distance = match (node_geo, record.metadata.client_geo_coordinates) {
        (Some(own), Some(client)) => own.distance_km(&client) / 100.0,
        _ => 0.0,
    };
    footprint + staleness + distance
}

#[async_trait]
impl BestOffloadTargetsCommands for InMemoryStore {
    async fn best_sessions_to_offload(
        &self,
        opt: &BestOffloadTargetsOptions,
    ) -> Result<HashMap<SessionId, SessionInfoForOffloadDecision>, CommandError> {
        let inner = self.inner.read().await;
        let node_geo = inner.self_node(&self.host).map(|node| node.geo_coordinates);
        let at = now();

        let mut ranked: Vec<(&SessionId, &SessionRecord, f64)> = inner
            .sessions
            .iter()
            .filter(|(_, record)| record.status.is_live() && record.offload_blockers == 0)
            .map(|(id, record)| (id, record, session_cost(record, node_geo, at)))
            .collect();
        ranked.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        Ok(ranked
            .into_iter()
            .take(opt.max_sessions)
            .map(|(id, record, _)| {
                (
                    id.clone(),
                    SessionInfoForOffloadDecision {
                        metadata: record.metadata.clone(),
                        resources_usage: record.usage.clone(),
                    },
                )
            })
            .collect())
    }

    async fn best_offload_target_nodes(
        &self,
        from_host: &str,
        sessions: HashMap<SessionId, SessionInfoForOffloadDecision>,
        opt: &BestOffloadTargetsOptions,
    ) -> Result<Vec<(SessionId, String)>, CommandError> {
        let inner = self.inner.read().await;
        let candidates: Vec<&Node> = inner
            .infrastructure
            .flatten()
            .into_iter()
            .map(|area| &area.node)
            .filter(|node| node.host != from_host)
            .collect();

        // Deterministic output: sessions in id order, candidates scored and
        // tie-broken by host name.
        let mut ordered: Vec<(&SessionId, &SessionInfoForOffloadDecision)> =
            sessions.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let mut targets = Vec::new();
        for (session_id, info) in ordered {
            let client = info.metadata.client_geo_coordinates.or_else(|| {
                inner
                    .infrastructure
                    .node_by_host(&info.metadata.created_in)
                    .map(|node| node.geo_coordinates)
            });

            let mut scored: Vec<(&&Node, f64)> = candidates
                .iter()
                .map(|node| {
                    let distance = client
                        .map(|client| node.geo_coordinates.distance_km(&client))
                        .unwrap_or(0.0);
                    let usage = inner
                        .known_usage(&self.host, &node.host)
                        .cloned()
                        .unwrap_or_default();
                    let headroom = min_headroom(&node.resources, &usage);
                    // Proximity dominates; scarce headroom inflates the
                    // effective distance, zero headroom pushes a node last.
                    (node, distance * (1.0 + 1.0 / headroom))
                })
                .collect();
            scored.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.host.cmp(&b.0.host))
            });

            for (node, _) in scored.into_iter().take(opt.max_targets_per_session) {
                targets.push((session_id.clone(), node.host.clone()));
            }
        }
        Ok(targets)
    }

    async fn find_lookup_node(&self, session_ids: &[SessionId]) -> Result<Node, CommandError> {
        let inner = self.inner.read().await;
        let mut hosts: Vec<&str> = vec![self.host.as_str()];
        for session_id in session_ids {
            if let Some(record) = inner.sessions.get(session_id) {
                hosts.push(record.metadata.created_in.as_str());
            }
        }
        if let Some(area) = inner.infrastructure.common_ancestor(&hosts) {
            return Ok(area.node.clone());
        }
        inner
            .infrastructure
            .areas
            .first()
            .map(|area| area.node.clone())
            .ok_or_else(|| CommandError::Internal("infrastructure has no areas".into()))
    }
}

// ── Garbage collection ────────────────────────────────────────────────────────

#[async_trait]
impl GarbageCollectSessionsCommands for InMemoryStore {
    async fn garbage_collect_sessions(
        &self,
        opt: &GarbageCollectSessionsOptions,
        cursor: Option<&str>,
    ) -> Result<Option<String>, CommandError> {
        let start = parse_cursor(cursor)?;
        let mut inner = self.inner.write().await;
        let ids = inner.sorted_ids(|_| true);
        let (batch, next) = page(ids, start, GC_BATCH);

        let at = now();
        let mut removed = Vec::new();
        for session_id in &batch {
            let Some(record) = inner.sessions.get(session_id) else { continue };
            if !record.metadata.is_expired(at) {
                continue;
            }
            let collect = match record.status {
                // Forwarding entry reclaim.
                SessionStatus::Offloaded { .. } => true,
                // Mid-migration sessions are never swept.
                SessionStatus::Offloading => false,
                SessionStatus::Live => {
                    record.acquisitions == 0
                        || opt
                            .expired_unreleased_older_than
                            .is_some_and(|age| at - record.metadata.updated_at >= age)
                }
            };
            if collect {
                removed.push(session_id.clone());
            }
        }
        for session_id in &removed {
            inner.sessions.remove(session_id);
            debug!(session_id = %session_id, "collected expired session");
        }
        if !removed.is_empty() {
            inner.recompute_own_usage();
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    fn infra() -> Arc<Infrastructure> {
        let json = r#"{
            "areaIdentifiers": ["region", "site"],
            "areas": [{
                "areaName": "hub", "host": "hub.example",
                "geoCoordinates": {"latitude": 46.0, "longitude": 10.0},
                "resources": {"cpu": 4.0},
                "areas": [
                    {"areaName": "edge-a", "host": "edge-a.example",
                     "geoCoordinates": {"latitude": 45.46, "longitude": 9.19},
                     "resources": {"cpu": 4.0}},
                    {"areaName": "edge-b", "host": "edge-b.example",
                     "geoCoordinates": {"latitude": 41.9, "longitude": 12.5},
                     "resources": {"cpu": 8.0}}
                ]
            }]
        }"#;
        Arc::new(Infrastructure::from_json(json.as_bytes()).unwrap())
    }

    fn store(host: &str) -> InMemoryStore {
        InMemoryStore::new(host, infra())
    }

    struct RecordingNotifier {
        calls: Mutex<Vec<(SessionLocation, SessionLocation)>>,
        respond: bool,
    }

    impl RecordingNotifier {
        fn new(respond: bool) -> Self {
            RecordingNotifier { calls: Mutex::new(Vec::new()), respond }
        }
    }

    #[async_trait]
    impl LastVisitedNotifier for RecordingNotifier {
        async fn notify(
            &self,
            last_visited: SessionLocation,
            new_location: SessionLocation,
        ) -> Result<bool, CommandError> {
            self.calls.lock().await.push((last_visited, new_location));
            Ok(self.respond)
        }
    }

    async fn drive_offload(store: &InMemoryStore, session_id: &SessionId) -> Vec<u8> {
        let (mut reader, loader) = store
            .offload_session(session_id, &OffloadSessionOptions::default())
            .await
            .unwrap();
        let handle = tokio::spawn(loader.unwrap());
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        handle.await.unwrap().unwrap();
        data
    }

    #[tokio::test]
    async fn create_acquire_release_balance() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();

        let opt = AcquireSessionOptions::default();
        assert!(store.acquire_session(&id, &opt).await.unwrap().is_none());
        assert!(store.acquire_session(&id, &opt).await.unwrap().is_none());
        store.release_session(&id, &opt).await.unwrap();
        store.release_session(&id, &opt).await.unwrap();
        assert!(matches!(
            store.release_session(&id, &opt).await,
            Err(CommandError::NoAcquisitionToRelease(_))
        ));
    }

    #[tokio::test]
    async fn acquire_unknown_session_fails() {
        let store = store("edge-a.example");
        assert!(matches!(
            store
                .acquire_session(&SessionId::new("nope"), &AcquireSessionOptions::default())
                .await,
            Err(CommandError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn explicit_id_conflict() {
        let store = store("edge-a.example");
        let opt = CreateSessionOptions {
            session_id: Some(SessionId::new("fixed")),
            ..Default::default()
        };
        store.create_session(&opt).await.unwrap();
        assert!(matches!(
            store.create_session(&opt).await,
            Err(CommandError::SessionIdAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn offload_blocked_by_default_acquisition() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        store
            .acquire_session(&id, &AcquireSessionOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            store.offload_session(&id, &OffloadSessionOptions::default()).await,
            Err(CommandError::UnableToOffloadAcquiredSession(_))
        ));
    }

    #[tokio::test]
    async fn offload_allowed_when_every_acquirer_permits_it() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        let permissive = AcquireSessionOptions { allow_offloading: true, ..Default::default() };
        store.acquire_session(&id, &permissive).await.unwrap();
        assert!(store
            .offload_session(&id, &OffloadSessionOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn acquire_during_offloading_needs_opt_in() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        store
            .offload_session(&id, &OffloadSessionOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            store.acquire_session(&id, &AcquireSessionOptions::default()).await,
            Err(CommandError::SessionIsOffloading(_))
        ));
        let read_only = AcquireSessionOptions { allow_while_offloading: true, ..Default::default() };
        assert!(store.acquire_session(&id, &read_only).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offload_stream_round_trips_and_abort_restores_live() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        store.set_session_data(&id, payload.clone()).await.unwrap();

        let streamed = drive_offload(&store, &id).await;
        assert_eq!(streamed, payload);
        assert_eq!(
            store.session_status(&id).await.unwrap(),
            SessionStatus::Offloading
        );

        store.abort_session_offload(&id).await.unwrap();
        assert_eq!(store.session_status(&id).await.unwrap(), SessionStatus::Live);
    }

    #[tokio::test]
    async fn migration_between_two_stores() {
        let source = store("edge-a.example");
        let destination = store("edge-b.example");

        let id = source.create_session(&CreateSessionOptions::default()).await.unwrap();
        source.set_session_data(&id, b"key-space".to_vec()).await.unwrap();
        let metadata = source.get_session_metadata(&id).await.unwrap();

        let (reader, loader) = source
            .offload_session(&id, &OffloadSessionOptions::default())
            .await
            .unwrap();
        let handle = tokio::spawn(loader.unwrap());
        let new_id = destination
            .onload_session(
                metadata,
                reader,
                &OnloadSessionOptions {
                    offloaded_from: Some(SessionLocation::new("edge-a.example", id.clone())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let new_location = SessionLocation::new("edge-b.example", new_id.clone());
        let notifier = RecordingNotifier::new(false);
        source
            .confirm_session_offload(
                &id,
                new_location.clone(),
                &OffloadSessionOptions::default(),
                &notifier,
            )
            .await
            .unwrap();
        // The session was created on the source; no stale pointer to hop.
        assert!(notifier.calls.lock().await.is_empty());

        // Never Live on both nodes: the source now only forwards.
        let forwarded = source
            .acquire_session(&id, &AcquireSessionOptions::default())
            .await
            .unwrap();
        assert_eq!(forwarded, Some(new_location.clone()));
        assert!(destination
            .acquire_session(&new_id, &AcquireSessionOptions::default())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            destination.session_data(&new_id).await.unwrap(),
            b"key-space".to_vec()
        );

        // A client went through the stale pointer, so the next hop learns it.
        let redirected = source
            .update_offloaded_session_location(
                &id,
                SessionLocation::new("hub.example", SessionId::new("elsewhere")),
            )
            .await
            .unwrap();
        assert!(redirected);
    }

    #[tokio::test]
    async fn confirm_notifies_the_previous_node() {
        let middle = store("edge-a.example");
        let origin = SessionLocation::new("hub.example", SessionId::new("s-origin"));

        let id = middle
            .onload_session(
                SessionMetadata {
                    client_geo_coordinates: None,
                    created_in: "hub.example".into(),
                    created_at: now(),
                    updated_at: now(),
                    expires_at: None,
                },
                Box::new(std::io::Cursor::new(b"bytes".to_vec())),
                &OnloadSessionOptions {
                    offloaded_from: Some(origin.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        middle
            .offload_session(&id, &OffloadSessionOptions::default())
            .await
            .unwrap();
        let next = SessionLocation::new("edge-b.example", SessionId::new("s-next"));
        let notifier = RecordingNotifier::new(true);
        middle
            .confirm_session_offload(&id, next.clone(), &OffloadSessionOptions::default(), &notifier)
            .await
            .unwrap();

        let calls = notifier.calls.lock().await;
        assert_eq!(calls.as_slice(), &[(origin, next)]);
    }

    #[tokio::test]
    async fn onload_duplicate_id_fails() {
        let store = store("edge-b.example");
        let metadata = SessionMetadata {
            client_geo_coordinates: None,
            created_in: "edge-a.example".into(),
            created_at: now(),
            updated_at: now(),
            expires_at: None,
        };
        let opt = OnloadSessionOptions {
            session_id: Some(SessionId::new("taken")),
            ..Default::default()
        };
        store
            .onload_session(
                metadata.clone(),
                Box::new(std::io::Cursor::new(Vec::new())),
                &opt,
            )
            .await
            .unwrap();
        assert!(matches!(
            store
                .onload_session(metadata, Box::new(std::io::Cursor::new(Vec::new())), &opt)
                .await,
            Err(CommandError::SessionAlreadyOnloaded(_))
        ));
    }

    #[tokio::test]
    async fn scan_pages_with_cursor() {
        let store = store("edge-a.example");
        for i in 0..5 {
            store
                .create_session(&CreateSessionOptions {
                    session_id: Some(SessionId::new(format!("s-{i}"))),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let (first, next) = store.scan_sessions(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let (second, next) = store.scan_sessions(next.as_deref(), 2).await.unwrap();
        assert_eq!(second.len(), 2);
        let (third, end) = store.scan_sessions(next.as_deref(), 2).await.unwrap();
        assert_eq!(third.len(), 1);
        assert!(end.is_none());

        assert!(matches!(
            store.scan_sessions(Some("not-a-number"), 2).await,
            Err(CommandError::InvalidCursor(_))
        ));
        assert!(matches!(
            store.scan_sessions(None, 0).await,
            Err(CommandError::InvalidCount(_))
        ));
    }

    #[tokio::test]
    async fn scan_offloadable_skips_blocked_sessions() {
        let store = store("edge-a.example");
        let free = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("free")),
                ..Default::default()
            })
            .await
            .unwrap();
        let held = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("held")),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .acquire_session(&held, &AcquireSessionOptions::default())
            .await
            .unwrap();

        let (ids, _) = store.scan_offloadable_sessions(None, 10).await.unwrap();
        assert_eq!(ids, vec![free]);
    }

    #[tokio::test]
    async fn rollup_overwrites_per_host_and_includes_own_entry() {
        let hub = store("hub.example");
        let mut push = HashMap::new();
        push.insert("edge-a.example".to_string(), ResourcesUsage::from([("cpu".to_string(), 1.0)]));
        hub.resources_usage_update_from_child(3, push).await.unwrap();

        // A fresher push from the same child overwrites its entries.
        let mut push = HashMap::new();
        push.insert("edge-a.example".to_string(), ResourcesUsage::from([("cpu".to_string(), 2.5)]));
        hub.resources_usage_update_from_child(5, push).await.unwrap();

        let (sessions, map) = hub.resources_usage_update_to_parent().await.unwrap();
        assert_eq!(sessions, 5);
        assert_eq!(map["edge-a.example"]["cpu"], 2.5);
        assert!(map.contains_key("hub.example"));
    }

    #[tokio::test]
    async fn redirect_new_requests_sheds_to_freest_child() {
        let hub = store("hub.example");
        // Hub is saturated: cpu usage 8 against capacity 4.
        let id = hub.create_session(&CreateSessionOptions::default()).await.unwrap();
        hub.update_session_resources_usage(&id, ResourcesUsage::from([("cpu".to_string(), 8.0)]))
            .await
            .unwrap();

        assert!(hub.redirect_new_requests().await.unwrap().is_none());

        let mut push = HashMap::new();
        push.insert("edge-b.example".to_string(), ResourcesUsage::from([("cpu".to_string(), 1.0)]));
        hub.resources_usage_update_from_child(1, push).await.unwrap();

        assert_eq!(
            hub.redirect_new_requests().await.unwrap(),
            Some("edge-b.example".to_string())
        );
    }

    #[tokio::test]
    async fn redirect_new_requests_quiet_when_headroom_is_fine() {
        let hub = store("hub.example");
        let id = hub.create_session(&CreateSessionOptions::default()).await.unwrap();
        hub.update_session_resources_usage(&id, ResourcesUsage::from([("cpu".to_string(), 1.0)]))
            .await
            .unwrap();
        assert!(hub.redirect_new_requests().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn best_sessions_ranked_by_cost() {
        let store = store("edge-a.example");
        let light = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("light")),
                ..Default::default()
            })
            .await
            .unwrap();
        let heavy = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("heavy")),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update_session_resources_usage(&light, ResourcesUsage::from([("cpu".to_string(), 0.1)]))
            .await
            .unwrap();
        store
            .update_session_resources_usage(&heavy, ResourcesUsage::from([("cpu".to_string(), 3.0)]))
            .await
            .unwrap();

        let picked = store
            .best_sessions_to_offload(&BestOffloadTargetsOptions {
                max_sessions: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(picked.contains_key(&heavy));
        assert!(!picked.contains_key(&light));
    }

    #[tokio::test]
    async fn best_targets_exclude_source_and_are_deterministic() {
        let store = store("edge-a.example");
        let id = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        let sessions = store
            .best_sessions_to_offload(&BestOffloadTargetsOptions::default())
            .await
            .unwrap();
        assert!(sessions.contains_key(&id));

        let opt = BestOffloadTargetsOptions { max_targets_per_session: 2, ..Default::default() };
        let first = store
            .best_offload_target_nodes("edge-a.example", sessions.clone(), &opt)
            .await
            .unwrap();
        let second = store
            .best_offload_target_nodes("edge-a.example", sessions, &opt)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, host)| host != "edge-a.example"));
        // The client sits on edge-a, so the nearby hub outranks edge-b.
        assert_eq!(first[0].1, "hub.example");
    }

    #[tokio::test]
    async fn lookup_node_is_common_ancestor() {
        let store = store("edge-a.example");
        let local = store.create_session(&CreateSessionOptions::default()).await.unwrap();
        let node = store.find_lookup_node(&[local.clone()]).await.unwrap();
        assert_eq!(node.host, "edge-a.example");

        // A session born on the sibling edge pulls the view up to the hub.
        let foreign = store
            .onload_session(
                SessionMetadata {
                    client_geo_coordinates: None,
                    created_in: "edge-b.example".into(),
                    created_at: now(),
                    updated_at: now(),
                    expires_at: None,
                },
                Box::new(std::io::Cursor::new(Vec::new())),
                &OnloadSessionOptions::default(),
            )
            .await
            .unwrap();
        let node = store.find_lookup_node(&[local, foreign]).await.unwrap();
        assert_eq!(node.host, "hub.example");
    }

    #[tokio::test]
    async fn gc_sweeps_expired_sessions_and_forwarding_entries() {
        let store = store("edge-a.example");
        let expired = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("expired")),
                expires_at: Some(now() - 10),
                ..Default::default()
            })
            .await
            .unwrap();
        let fresh = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("fresh")),
                ..Default::default()
            })
            .await
            .unwrap();
        let pointer = store
            .create_session(&CreateSessionOptions {
                session_id: Some(SessionId::new("pointer")),
                expires_at: Some(now() - 10),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .offload_session(&pointer, &OffloadSessionOptions::default())
            .await
            .unwrap();
        store
            .confirm_session_offload(
                &pointer,
                SessionLocation::new("edge-b.example", SessionId::new("x")),
                &OffloadSessionOptions::default(),
                &RecordingNotifier::new(false),
            )
            .await
            .unwrap();

        let mut cursor = None;
        loop {
            cursor = store
                .garbage_collect_sessions(
                    &GarbageCollectSessionsOptions::default(),
                    cursor.as_deref(),
                )
                .await
                .unwrap();
            if cursor.is_none() {
                break;
            }
        }

        let (ids, _) = store.scan_sessions(None, 10).await.unwrap();
        assert_eq!(ids, vec![fresh.clone()]);
        assert!(!ids.contains(&expired));
    }

    #[tokio::test]
    async fn expired_but_held_session_needs_age_threshold() {
        let store = store("edge-a.example");
        let id = store
            .create_session(&CreateSessionOptions {
                expires_at: Some(now() - 100),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .acquire_session(&id, &AcquireSessionOptions::default())
            .await
            .unwrap();

        store
            .garbage_collect_sessions(&GarbageCollectSessionsOptions::default(), None)
            .await
            .unwrap();
        assert!(store.session_status(&id).await.is_ok());

        // updated_at moved on acquire, so an instant threshold collects it.
        store
            .garbage_collect_sessions(
                &GarbageCollectSessionsOptions { expired_unreleased_older_than: Some(0) },
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            store.session_status(&id).await,
            Err(CommandError::SessionNotFound(_))
        ));
    }
}
