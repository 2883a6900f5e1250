use std::sync::Arc;

use axum::response::Response;
use futures::future::BoxFuture;
use roam_domain::SessionToken;
use roam_node::{Node, PeerClient};

use crate::pipeline::SessionLayerOptions;

/// The application work function: runs under a held session acquisition and
/// produces the response body.
pub type AppHandler = Arc<dyn Fn(SessionToken) -> BoxFuture<'static, Response> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub node: Node,
    pub options: Arc<SessionLayerOptions>,
    pub peer: Arc<dyn PeerClient>,
    pub app_handler: AppHandler,
}
