pub mod error;
pub mod geo;
pub mod node;
pub mod tree;

pub use error::InfrastructureError;
pub use geo::GeoCoordinates;
pub use node::{Node, Resources, UNLIMITED_CAPACITY};
pub use tree::{Area, Infrastructure};
