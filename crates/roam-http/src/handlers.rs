use std::collections::HashMap;
use std::io;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use roam_domain::{
    ResourcesUsage, SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
};
use roam_store::{BestOffloadTargetsOptions, OffloadSessionOptions, OnloadSessionOptions};
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;

use crate::error::ApiError;
use crate::pipeline::handle_with_session;
use crate::state::AppState;

// Wire constants of the inter-node surface.
pub const OLD_LOCATION_HEADER: &str = "x-session-old-location";
pub const METADATA_HEADER: &str = "x-session-metadata";
pub const LAST_VISITED_SESSION_ID_HEADER: &str = "x-session-last-visited-session-id";
pub const NEW_LOCATION_HEADER: &str = "x-session-new-location";

pub const OFFLOAD_REQUEST_TYPE: &str = "offload";
pub const ONLOAD_REQUEST_TYPE: &str = "onload";
pub const CONFIRM_OFFLOAD_REQUEST_TYPE: &str = "confirm_offload";

/// Child-to-parent status push body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPushBody {
    pub sessions: u64,
    pub resources_usage_nodes_map: HashMap<String, ResourcesUsage>,
}

#[derive(Debug, Deserialize)]
pub struct InternodeQuery {
    #[serde(rename = "type")]
    pub request_type: Option<String>,
    #[serde(rename = "toHost")]
    pub to_host: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "nodeId")]
    pub node_id: Option<String>,
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// The session-facing entry point: every request runs through the token →
/// classify → dispatch pipeline around the configured work function.
pub async fn app_entry(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let handler = state.app_handler.clone();
    handle_with_session(&state.node, &state.options, &headers, move |token| handler(token)).await
}

/// One route serves the whole inter-node surface, dispatched on the query:
/// `type=offload|onload|confirm_offload`, `nodeId=<n>` for target-selection
/// queries, and a bare POST for the child status push.
pub async fn internode(
    State(state): State<AppState>,
    Query(query): Query<InternodeQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match query.request_type.as_deref() {
        Some(OFFLOAD_REQUEST_TYPE) => offload(state, query).await.into_response(),
        Some(ONLOAD_REQUEST_TYPE) => onload(state, headers, body).await.into_response(),
        Some(CONFIRM_OFFLOAD_REQUEST_TYPE) => {
            confirm_offload(state, headers).await.into_response()
        }
        Some(other) => {
            ApiError::bad_request(format!("unknown request type '{other}'")).into_response()
        }
        None if query.node_id.is_some() => {
            best_offload_targets(state, query, body).await.into_response()
        }
        None => receive_status(state, body).await.into_response(),
    }
}

/// Ask this node to offload one of its sessions to a peer. Responds with
/// the id the session got at its destination.
async fn offload(state: AppState, query: InternodeQuery) -> Result<Response, ApiError> {
    let (Some(to_host), Some(session_id)) = (query.to_host, query.session_id) else {
        return Err(ApiError::bad_request("offload requires toHost and sessionId"));
    };
    let new_location = state
        .node
        .offload_session_to(
            &SessionId::new(session_id),
            &to_host,
            &OffloadSessionOptions::default(),
            state.peer.as_ref(),
        )
        .await?;
    Ok(new_location.session_id.to_string().into_response())
}

/// Receive a streamed session. Metadata and the previous location travel in
/// headers, the key space in the body.
async fn onload(state: AppState, headers: HeaderMap, body: Body) -> Result<Response, ApiError> {
    let offloaded_from: SessionLocation = header_json(&headers, OLD_LOCATION_HEADER)?;
    let metadata: SessionMetadata = header_json(&headers, METADATA_HEADER)?;

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let location = state
        .node
        .onload_session(
            metadata,
            Box::new(reader),
            &OnloadSessionOptions {
                offloaded_from: Some(offloaded_from),
                ..Default::default()
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(location)).into_response())
}

/// Hop the forwarding pointer this node still holds. Responds `"true"` when
/// a client has already been redirected through it.
async fn confirm_offload(state: AppState, headers: HeaderMap) -> Result<Response, ApiError> {
    let session_id = headers
        .get(LAST_VISITED_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError::bad_request(format!("missing {LAST_VISITED_SESSION_ID_HEADER} header"))
        })?;
    let new_location: SessionLocation = header_json(&headers, NEW_LOCATION_HEADER)?;

    let client_redirected = state
        .node
        .update_offloaded_session_location(&SessionId::new(session_id), new_location)
        .await?;
    Ok(client_redirected.to_string().into_response())
}

async fn best_offload_targets(
    state: AppState,
    query: InternodeQuery,
    body: Body,
) -> Result<Response, ApiError> {
    let node_id = query.node_id.unwrap_or_default();
    let sessions: HashMap<SessionId, SessionInfoForOffloadDecision> = body_json(body).await?;
    let targets = state
        .node
        .commands()
        .best_offload_target_nodes(&node_id, sessions, &BestOffloadTargetsOptions::default())
        .await?;
    Ok(Json(targets).into_response())
}

async fn receive_status(state: AppState, body: Body) -> Result<Response, ApiError> {
    let payload: StatusPushBody = body_json(body).await?;
    state
        .node
        .resources_usage_update_from_child(payload.sessions, payload.resources_usage_nodes_map)
        .await?;
    Ok(StatusCode::OK.into_response())
}

fn header_json<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    name: &str,
) -> Result<T, ApiError> {
    let value = headers
        .get(name)
        .ok_or_else(|| ApiError::bad_request(format!("missing {name} header")))?;
    serde_json::from_slice(value.as_bytes())
        .map_err(|error| ApiError::bad_request(format!("malformed {name} header: {error}")))
}

async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|error| ApiError::bad_request(format!("unreadable body: {error}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|error| ApiError::bad_request(format!("malformed body: {error}")))
}
