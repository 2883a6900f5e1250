use thiserror::Error;

/// Validation errors for the infrastructure tree. Each rule violation is a
/// distinct variant so callers can match on the exact failure.
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("area tree deeper than the declared identifier levels")]
    AreaMaxDepth,

    #[error("area name not unique: {0}")]
    AreaNameNotUnique(String),

    #[error("host not unique: {0}")]
    HostNotUnique(String),

    #[error("area name cannot be empty")]
    AreaNameEmpty,

    #[error("host cannot be empty")]
    HostEmpty,

    #[error("latitude out of range: {0}")]
    LatitudeOutOfRange(f64),

    #[error("longitude out of range: {0}")]
    LongitudeOutOfRange(f64),

    #[error("resource '{resource}' has negative value {value}")]
    ResourceValueNegative { resource: String, value: f64 },

    #[error("area identifiers cannot be empty")]
    IdentifiersEmpty,

    #[error("area identifier cannot be empty")]
    IdentifierEmpty,

    #[error("area identifier not unique: {0}")]
    IdentifiersNotUnique(String),

    #[error("infrastructure json: {0}")]
    Json(#[from] serde_json::Error),
}
