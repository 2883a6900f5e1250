use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use axum::response::IntoResponse;
use axum::Json;
use futures::FutureExt;
use roam_config::NodeConfig;
use roam_http::{build_app, AppHandler, AppState, HttpPeerClient, SessionLayerOptions};
use roam_infra::Infrastructure;
use roam_node::{Node, PeerClient};
use roam_store::{GarbageCollectSessionsOptions, InMemoryStore};
use tracing::{info, warn};

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(config_path: PathBuf) -> Result<()> {
    let config = roam_config::load_node_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let infra = Arc::new(config.infrastructure.clone());
    let store = InMemoryStore::new(&config.host, infra.clone());
    let node = Node::new(config.node.clone(), infra, Arc::new(store));
    let peer: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(
        &config.peer_scheme,
        &config.internode_path,
    ));

    let token_header = HeaderName::try_from(config.token_header.as_str())
        .with_context(|| format!("invalid token header name '{}'", config.token_header))?;
    let options = SessionLayerOptions { token_header, ..Default::default() };

    // Default application surface: echo the session's location. Deployments
    // embed roam-http directly when they need richer handlers.
    let app_handler: AppHandler = Arc::new(|token| {
        async move {
            Json(serde_json::json!({
                "host": token.host(),
                "sessionId": token.session_id().as_str(),
            }))
            .into_response()
        }
        .boxed()
    });

    spawn_schedulers(&config, &node, &peer);

    let state = AppState {
        node,
        options: Arc::new(options),
        peer,
        app_handler,
    };
    let app = build_app(state);

    info!(host = %config.host, bind = %config.bind_addr, "node listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}

fn spawn_schedulers(config: &NodeConfig, node: &Node, peer: &Arc<dyn PeerClient>) {
    spawn_interval("status-push", config.status_push_interval, {
        let node = node.clone();
        let peer = peer.clone();
        move || {
            let node = node.clone();
            let peer = peer.clone();
            async move { node.send_status_to_parent(peer.as_ref()).await.map(|_| ()) }
        }
    });

    spawn_interval("offload-check", config.offload_check_interval, {
        let node = node.clone();
        let peer = peer.clone();
        move || {
            let node = node.clone();
            let peer = peer.clone();
            async move { node.begin_offload(peer.as_ref()).await.map(|_| ()) }
        }
    });

    spawn_interval("session-gc", config.gc_interval, {
        let node = node.clone();
        move || {
            let node = node.clone();
            async move {
                node.garbage_collect_sessions(&GarbageCollectSessionsOptions::default())
                    .await
                    .map_err(roam_node::NodeError::from)
            }
        }
    });
}

fn spawn_interval<F, Fut>(name: &'static str, period: Duration, mut step: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), roam_node::NodeError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = step().await {
                warn!(task = name, error = %error, "scheduled step failed");
            }
        }
    });
}

// ── Check ─────────────────────────────────────────────────────────────────────

pub fn check(infrastructure_path: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&infrastructure_path)
        .with_context(|| format!("reading {}", infrastructure_path.display()))?;
    let infrastructure = Infrastructure::from_json(&bytes)
        .with_context(|| format!("validating {}", infrastructure_path.display()))?;

    println!(
        "ok: {} levels ({}), {} areas",
        infrastructure.area_identifiers.len(),
        infrastructure.area_identifiers.join(" > "),
        infrastructure.flatten().len(),
    );
    for area in infrastructure.flatten() {
        let (_, chain) = infrastructure
            .lookup(&area.node.area_name)
            .expect("flattened area is always found");
        println!(
            "{}{}  [{}]",
            "  ".repeat(chain.len()),
            area.node.area_name,
            area.node.host,
        );
    }
    Ok(())
}
