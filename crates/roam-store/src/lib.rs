pub mod commands;
pub mod error;
pub mod memory;
pub mod options;
pub mod state;

pub use commands::{
    AcquireSessionCommands, BestOffloadTargetsCommands, Commands, CreateSessionCommands,
    GarbageCollectSessionsCommands, LastVisitedNotifier, OffloadSessionCommands,
    OnloadSessionCommands, ResourcesUsageCommands, SessionDataLoader, SessionDataStream,
    SessionMetadataCommands,
};
pub use error::CommandError;
pub use memory::InMemoryStore;
pub use options::{
    AcquireSessionOptions, BestOffloadTargetsOptions, CreateAndAcquireSessionOptions,
    CreateSessionOptions, GarbageCollectSessionsOptions, OffloadSessionOptions,
    OnloadSessionOptions, SessionMetadataOptions,
};
pub use state::SessionStatus;
