use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use roam_domain::{
    ResourcesUsage, SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
};
use roam_node::{PeerClient, PeerError};
use roam_store::SessionDataStream;
use tokio_util::io::ReaderStream;

use crate::handlers::{
    StatusPushBody, CONFIRM_OFFLOAD_REQUEST_TYPE, LAST_VISITED_SESSION_ID_HEADER,
    METADATA_HEADER, NEW_LOCATION_HEADER, OFFLOAD_REQUEST_TYPE, OLD_LOCATION_HEADER,
    ONLOAD_REQUEST_TYPE,
};

/// HTTP binding of the inter-node transport: the client side of the
/// `/internode` surface.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    scheme: String,
    path: String,
}

impl HttpPeerClient {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        HttpPeerClient {
            client: reqwest::Client::new(),
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    fn url(&self, host: &str) -> String {
        format!("{}://{}{}", self.scheme, host, self.path)
    }

    fn json_header<T: serde::Serialize>(value: &T) -> Result<String, PeerError> {
        serde_json::to_string(value).map_err(|error| PeerError::Request(error.to_string()))
    }
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> Result<reqwest::Response, PeerError> {
    if response.status() != expected {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(PeerError::Status { status, body });
    }
    Ok(response)
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn issue_offload(
        &self,
        host: &str,
        session_id: &SessionId,
        to_host: &str,
    ) -> Result<SessionId, PeerError> {
        let response = self
            .client
            .post(self.url(host))
            .query(&[
                ("type", OFFLOAD_REQUEST_TYPE),
                ("toHost", to_host),
                ("sessionId", session_id.as_str()),
            ])
            .send()
            .await
            .map_err(|error| PeerError::Request(error.to_string()))?;
        let response = expect_status(response, StatusCode::OK).await?;
        let new_session_id = response
            .text()
            .await
            .map_err(|error| PeerError::Decode(error.to_string()))?;
        Ok(SessionId::new(new_session_id))
    }

    async fn issue_onload(
        &self,
        host: &str,
        offloaded_from: &SessionLocation,
        metadata: &SessionMetadata,
        body: SessionDataStream,
    ) -> Result<SessionLocation, PeerError> {
        let response = self
            .client
            .post(self.url(host))
            .query(&[("type", ONLOAD_REQUEST_TYPE)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(OLD_LOCATION_HEADER, Self::json_header(offloaded_from)?)
            .header(METADATA_HEADER, Self::json_header(metadata)?)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await
            .map_err(|error| PeerError::Request(error.to_string()))?;
        let response = expect_status(response, StatusCode::CREATED).await?;
        response
            .json::<SessionLocation>()
            .await
            .map_err(|error| PeerError::Decode(error.to_string()))
    }

    async fn issue_confirm_offload(
        &self,
        last_visited: &SessionLocation,
        new_location: &SessionLocation,
    ) -> Result<bool, PeerError> {
        let response = self
            .client
            .post(self.url(&last_visited.host))
            .query(&[("type", CONFIRM_OFFLOAD_REQUEST_TYPE)])
            .header(LAST_VISITED_SESSION_ID_HEADER, last_visited.session_id.as_str())
            .header(NEW_LOCATION_HEADER, Self::json_header(new_location)?)
            .send()
            .await
            .map_err(|error| PeerError::Request(error.to_string()))?;
        let response = expect_status(response, StatusCode::OK).await?;
        let body = response
            .text()
            .await
            .map_err(|error| PeerError::Decode(error.to_string()))?;
        body.trim()
            .parse::<bool>()
            .map_err(|_| PeerError::Decode(format!("expected boolean body, got '{body}'")))
    }

    async fn issue_best_offload_targets(
        &self,
        host: &str,
        node_id: &str,
        sessions: &HashMap<SessionId, SessionInfoForOffloadDecision>,
    ) -> Result<Vec<(SessionId, String)>, PeerError> {
        let response = self
            .client
            .post(self.url(host))
            .query(&[("nodeId", node_id)])
            .json(sessions)
            .send()
            .await
            .map_err(|error| PeerError::Request(error.to_string()))?;
        let response = expect_status(response, StatusCode::OK).await?;
        response
            .json::<Vec<(SessionId, String)>>()
            .await
            .map_err(|error| PeerError::Decode(error.to_string()))
    }

    async fn issue_status_update(
        &self,
        host: &str,
        sessions: u64,
        usage_by_host: &HashMap<String, ResourcesUsage>,
    ) -> Result<(), PeerError> {
        let payload = StatusPushBody {
            sessions,
            resources_usage_nodes_map: usage_by_host.clone(),
        };
        let response = self
            .client
            .post(self.url(host))
            .json(&payload)
            .send()
            .await
            .map_err(|error| PeerError::Request(error.to_string()))?;
        expect_status(response, StatusCode::OK).await?;
        Ok(())
    }
}
