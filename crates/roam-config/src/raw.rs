use serde::Deserialize;

/// Raw YAML representation of a node config file.
#[derive(Debug, Deserialize)]
pub struct RawNodeConfig {
    /// This node's host; must appear in the infrastructure tree.
    pub host: String,
    pub bind_addr: String,
    /// Path to the infrastructure JSON, absolute or relative to the config
    /// file.
    pub infrastructure: String,
    pub peer_scheme: Option<String>,
    pub internode_path: Option<String>,
    pub token_header: Option<String>,
    pub status_push_interval_secs: Option<u64>,
    pub offload_check_interval_secs: Option<u64>,
    pub gc_interval_secs: Option<u64>,
}
