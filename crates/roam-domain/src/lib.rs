pub mod error;
pub mod types;

pub use error::DomainError;
pub use types::{
    ResourcesUsage, ResourcesUsageIndex, SessionId, SessionInfoForOffloadDecision,
    SessionLocation, SessionMetadata, SessionToken,
};
