use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// The topology failed validation; the node refuses to boot.
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] roam_infra::InfrastructureError),

    /// The configured host is not part of the loaded topology.
    #[error("host '{0}' not found in the infrastructure")]
    UnknownHost(String),
}
