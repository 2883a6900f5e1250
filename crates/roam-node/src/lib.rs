pub mod acquire;
pub mod error;
pub mod node;
pub mod offload;
pub mod peer;

pub use acquire::AcquireOutcome;
pub use error::NodeError;
pub use node::Node;
pub use peer::{PeerClient, PeerError, PeerLastVisitedNotifier};
