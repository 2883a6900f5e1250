use std::collections::HashMap;

use roam_infra::GeoCoordinates;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Identifier of a session, unique within its host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        SessionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Location & token ──────────────────────────────────────────────────────────

/// Where a session lives: the owning host plus the id it has there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLocation {
    pub host: String,
    pub session_id: SessionId,
}

impl SessionLocation {
    pub fn new(host: impl Into<String>, session_id: SessionId) -> Self {
        SessionLocation { host: host.into(), session_id }
    }
}

/// The wire token carried by clients. Wraps one [`SessionLocation`] and
/// serializes to the compact `{"host":…,"sessionId":…}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub SessionLocation);

impl SessionToken {
    pub fn new(location: SessionLocation) -> Self {
        SessionToken(location)
    }

    pub fn location(&self) -> &SessionLocation {
        &self.0
    }

    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn session_id(&self) -> &SessionId {
        &self.0.session_id
    }

    /// Decode token bytes. Empty input is the "client has no session yet"
    /// sentinel and decodes to `None` without error.
    pub fn decode(bytes: &[u8]) -> Result<Option<SessionToken>, DomainError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(DomainError::MalformedSessionToken)
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of two strings cannot fail to serialize.
        serde_json::to_vec(self).expect("session token serialization")
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Metadata attached to every session. Times are Unix seconds UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Position of the client that owns the session, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_geo_coordinates: Option<GeoCoordinates>,
    /// Host of the node that created the session. Immutable.
    pub created_in: String,
    pub created_at: i64,
    /// Advances on any acquire or metadata mutation.
    pub updated_at: i64,
    /// Absent means the session does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl SessionMetadata {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

// ── Resource usage ────────────────────────────────────────────────────────────

/// Measured usage per resource name.
pub type ResourcesUsage = HashMap<String, f64>;

/// Per-resource `capacity / usage` headroom. Higher means more slack.
pub type ResourcesUsageIndex = HashMap<String, f64>;

/// What the target selector needs to know about a candidate session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoForOffloadDecision {
    pub metadata: SessionMetadata,
    pub resources_usage: ResourcesUsage,
}
