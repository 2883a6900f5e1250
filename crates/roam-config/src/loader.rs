use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use roam_infra::Infrastructure;
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawNodeConfig;

const DEFAULT_PEER_SCHEME: &str = "http";
const DEFAULT_INTERNODE_PATH: &str = "/internode";
const DEFAULT_TOKEN_HEADER: &str = "x-ermes-token";
const DEFAULT_STATUS_PUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_OFFLOAD_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a node needs to boot.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub bind_addr: SocketAddr,
    pub infrastructure: Infrastructure,
    /// This node's entry in the tree.
    pub node: roam_infra::Node,
    pub peer_scheme: String,
    pub internode_path: String,
    pub token_header: String,
    pub status_push_interval: Duration,
    pub offload_check_interval: Duration,
    pub gc_interval: Duration,
}

/// Load and validate a node config. Topology violations and an unknown
/// `host` are fatal here, before anything listens.
pub fn load_node_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawNodeConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;

    let infrastructure_path = resolve(path, &raw.infrastructure);
    debug!("loading infrastructure from {}", infrastructure_path.display());
    let infrastructure_bytes =
        std::fs::read(&infrastructure_path).map_err(|e| ConfigError::Io {
            path: infrastructure_path.display().to_string(),
            source: e,
        })?;
    let infrastructure = Infrastructure::from_json(&infrastructure_bytes)?;

    let node = infrastructure
        .node_by_host(&raw.host)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownHost(raw.host.clone()))?;

    let bind_addr: SocketAddr = raw.bind_addr.parse().map_err(|e| ConfigError::InvalidBindAddr {
        value: raw.bind_addr.clone(),
        source: e,
    })?;

    Ok(NodeConfig {
        host: raw.host,
        bind_addr,
        infrastructure,
        node,
        peer_scheme: raw.peer_scheme.unwrap_or_else(|| DEFAULT_PEER_SCHEME.into()),
        internode_path: raw
            .internode_path
            .unwrap_or_else(|| DEFAULT_INTERNODE_PATH.into()),
        token_header: raw.token_header.unwrap_or_else(|| DEFAULT_TOKEN_HEADER.into()),
        status_push_interval: raw
            .status_push_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STATUS_PUSH_INTERVAL),
        offload_check_interval: raw
            .offload_check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_OFFLOAD_CHECK_INTERVAL),
        gc_interval: raw
            .gc_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GC_INTERVAL),
    })
}

fn resolve(config_path: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    config_path
        .parent()
        .map(|parent| parent.join(target))
        .unwrap_or_else(|| target.to_path_buf())
}
