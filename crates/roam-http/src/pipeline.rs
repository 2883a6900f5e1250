use std::future::Future;

use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use roam_domain::SessionToken;
use roam_node::{AcquireOutcome, Node};
use roam_store::{AcquireSessionOptions, CreateAndAcquireSessionOptions, CreateSessionOptions};
use tracing::warn;

use crate::error::ApiError;

/// Name of the header carrying the session token.
pub const DEFAULT_TOKEN_HEADER: &str = "x-ermes-token";

/// Per-deployment knobs of the session entry pipeline.
#[derive(Debug, Clone)]
pub struct SessionLayerOptions {
    pub token_header: HeaderName,
    pub acquire: AcquireSessionOptions,
    pub create: CreateSessionOptions,
}

impl Default for SessionLayerOptions {
    fn default() -> Self {
        SessionLayerOptions {
            token_header: HeaderName::from_static(DEFAULT_TOKEN_HEADER),
            acquire: AcquireSessionOptions::default(),
            create: CreateSessionOptions::default(),
        }
    }
}

impl SessionLayerOptions {
    fn create_and_acquire(&self) -> CreateAndAcquireSessionOptions {
        CreateAndAcquireSessionOptions {
            create: self.create.clone(),
            acquire: self.acquire.clone(),
        }
    }
}

fn redirect_to(host: &str) -> Response {
    match HeaderValue::from_str(host) {
        Ok(location) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        Err(_) => ApiError::internal(format!("redirect host not header-safe: {host}"))
            .into_response(),
    }
}

fn set_token_bytes(response: &mut Response, header: &HeaderName, bytes: &[u8]) {
    match HeaderValue::from_bytes(bytes) {
        Ok(value) => {
            response.headers_mut().insert(header.clone(), value);
        }
        Err(_) => warn!("session token not header-safe, dropped from response"),
    }
}

fn set_token(response: &mut Response, header: &HeaderName, token: &SessionToken) {
    set_token_bytes(response, header, &token.encode());
}

/// Drive one request through the session lifecycle and the supplied work
/// function.
///
/// Decision tree, in order:
/// 1. Malformed token bytes → 400.
/// 2. Token for another host → 302 there, token echoed unchanged.
/// 3. No token, node is shedding → 302 to the peer with more headroom.
/// 4. No token → create + acquire, run the handler, token on the response.
/// 5. Local token → acquire. Acquired runs the handler; a forwarded session
///    becomes a 302 carrying the freshest token; errors map to their status
///    class.
///
/// The outgoing response always carries the latest known token.
pub async fn handle_with_session<H, Fut>(
    node: &Node,
    opt: &SessionLayerOptions,
    headers: &HeaderMap,
    handler: H,
) -> Response
where
    H: FnOnce(SessionToken) -> Fut,
    Fut: Future<Output = Response>,
{
    let token_bytes = headers
        .get(&opt.token_header)
        .map(|value| value.as_bytes().to_vec())
        .unwrap_or_default();

    let token = match SessionToken::decode(&token_bytes) {
        Ok(token) => token,
        Err(error) => return ApiError::from(error).into_response(),
    };

    // A client that did not follow an earlier redirect is pointed back at
    // the session's host without touching storage.
    if let Some(token) = &token {
        if token.host() != node.host() {
            let mut response = redirect_to(token.host());
            set_token_bytes(&mut response, &opt.token_header, &token_bytes);
            return response;
        }
    }

    let Some(token) = token else {
        match node.redirect_new_requests().await {
            Ok(Some(target_host)) => return redirect_to(&target_host),
            Ok(None) => {}
            Err(error) => return ApiError::from(error).into_response(),
        }

        return match node
            .create_and_acquire_session(&opt.create_and_acquire(), |token| handler(token))
            .await
        {
            Ok((token, mut response)) => {
                set_token(&mut response, &opt.token_header, &token);
                response
            }
            Err(error) => ApiError::from(error).into_response(),
        };
    };

    let work_token = token.clone();
    let outcome = node
        .acquire_session(&token, &opt.acquire, move || handler(work_token))
        .await;
    match outcome {
        Ok(AcquireOutcome::Acquired(mut response)) => {
            set_token(&mut response, &opt.token_header, &token);
            response
        }
        Ok(AcquireOutcome::Forwarded(location)) => {
            let mut response = redirect_to(&location.host);
            set_token(&mut response, &opt.token_header, &SessionToken::new(location));
            response
        }
        Err(error) => ApiError::from(error).into_response(),
    }
}
