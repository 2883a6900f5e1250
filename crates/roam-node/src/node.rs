use std::collections::HashMap;
use std::sync::Arc;

use roam_domain::{
    ResourcesUsage, ResourcesUsageIndex, SessionId, SessionLocation, SessionMetadata, SessionToken,
};
use roam_infra::{Infrastructure, UNLIMITED_CAPACITY};
use roam_store::{
    Commands, CommandError, CreateSessionOptions, GarbageCollectSessionsOptions,
    OnloadSessionOptions, SessionMetadataOptions,
};
use tracing::debug;

use crate::error::NodeError;
use crate::peer::PeerClient;

/// One edge node of the mesh: its place in the topology plus the capability
/// surface of its storage layer. Cheap to clone; all entry points thread an
/// explicit node instance, there is no global state.
#[derive(Clone)]
pub struct Node {
    pub(crate) info: roam_infra::Node,
    pub(crate) infra: Arc<Infrastructure>,
    pub(crate) cmd: Arc<dyn Commands>,
}

impl Node {
    pub fn new(
        info: roam_infra::Node,
        infra: Arc<Infrastructure>,
        cmd: Arc<dyn Commands>,
    ) -> Self {
        Node { info, infra, cmd }
    }

    pub fn host(&self) -> &str {
        &self.info.host
    }

    pub fn info(&self) -> &roam_infra::Node {
        &self.info
    }

    pub fn infrastructure(&self) -> &Arc<Infrastructure> {
        &self.infra
    }

    pub fn commands(&self) -> &Arc<dyn Commands> {
        &self.cmd
    }

    pub(crate) fn location(&self, session_id: SessionId) -> SessionLocation {
        SessionLocation::new(self.info.host.clone(), session_id)
    }

    // ── Create / metadata ─────────────────────────────────────────────────

    /// Create a session without acquiring it. Returns the token to hand to
    /// the client.
    pub async fn create_session(
        &self,
        opt: &CreateSessionOptions,
    ) -> Result<SessionToken, CommandError> {
        let session_id = self.cmd.create_session(opt).await?;
        Ok(SessionToken::new(self.location(session_id)))
    }

    pub async fn get_session_metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionMetadata, CommandError> {
        self.cmd.get_session_metadata(session_id).await
    }

    pub async fn set_session_metadata(
        &self,
        session_id: &SessionId,
        opt: &SessionMetadataOptions,
    ) -> Result<(), CommandError> {
        self.cmd.set_session_metadata(session_id, opt).await
    }

    // ── Onload / forwarding ───────────────────────────────────────────────

    /// Receive an inbound transfer; the session becomes live here.
    pub async fn onload_session(
        &self,
        metadata: SessionMetadata,
        reader: roam_store::SessionDataStream,
        opt: &OnloadSessionOptions,
    ) -> Result<SessionLocation, CommandError> {
        let session_id = self.cmd.onload_session(metadata, reader, opt).await?;
        Ok(self.location(session_id))
    }

    /// Overwrite a forwarding pointer this node still holds.
    pub async fn update_offloaded_session_location(
        &self,
        session_id: &SessionId,
        new_location: SessionLocation,
    ) -> Result<bool, CommandError> {
        self.cmd
            .update_offloaded_session_location(session_id, new_location)
            .await
    }

    // ── Resource usage ────────────────────────────────────────────────────

    pub async fn get_session_resources_usage(
        &self,
        session_id: &SessionId,
    ) -> Result<ResourcesUsage, CommandError> {
        self.cmd.get_session_resources_usage(session_id).await
    }

    pub async fn get_node_resources_usage(
        &self,
        host: &str,
    ) -> Result<(u64, ResourcesUsage), CommandError> {
        self.cmd.get_node_resources_usage(host).await
    }

    pub async fn update_session_resources_usage(
        &self,
        session_id: &SessionId,
        usage: ResourcesUsage,
    ) -> Result<(), CommandError> {
        self.cmd.update_session_resources_usage(session_id, usage).await
    }

    /// Per-resource `capacity / usage` of this node. Unlimited capacity or
    /// an idle resource index as infinite slack.
    pub async fn node_resources_usage_index(&self) -> Result<ResourcesUsageIndex, CommandError> {
        let (_, usage) = self.cmd.get_node_resources_usage(&self.info.host).await?;
        let mut index = ResourcesUsageIndex::new();
        for (resource, capacity) in &self.info.resources {
            let used = usage.get(resource).copied().unwrap_or(0.0);
            let slack = if *capacity == UNLIMITED_CAPACITY || used <= 0.0 {
                f64::INFINITY
            } else {
                capacity / used
            };
            index.insert(resource.clone(), slack);
        }
        Ok(index)
    }

    pub async fn redirect_new_requests(&self) -> Result<Option<String>, CommandError> {
        self.cmd.redirect_new_requests().await
    }

    pub async fn resources_usage_update_from_child(
        &self,
        sessions: u64,
        usage_by_host: HashMap<String, ResourcesUsage>,
    ) -> Result<(), CommandError> {
        self.cmd
            .resources_usage_update_from_child(sessions, usage_by_host)
            .await
    }

    /// Push the aggregate status one level up the tree. A root has nothing
    /// to push to and returns immediately.
    pub async fn send_status_to_parent(&self, peer: &dyn PeerClient) -> Result<(), NodeError> {
        let Some(parent_host) = self
            .infra
            .parent_of(&self.info.host)
            .map(|parent| parent.host.clone())
        else {
            return Ok(());
        };
        let (sessions, usage_by_host) = self.cmd.resources_usage_update_to_parent().await?;
        peer.issue_status_update(&parent_host, sessions, &usage_by_host).await?;
        debug!(parent = %parent_host, sessions, "status pushed to parent");
        Ok(())
    }

    // ── Garbage collection ────────────────────────────────────────────────

    /// Run the sweep to completion, batch by batch.
    pub async fn garbage_collect_sessions(
        &self,
        opt: &GarbageCollectSessionsOptions,
    ) -> Result<(), CommandError> {
        let mut cursor = None;
        loop {
            cursor = self.cmd.garbage_collect_sessions(opt, cursor.as_deref()).await?;
            if cursor.is_none() {
                return Ok(());
            }
        }
    }
}
