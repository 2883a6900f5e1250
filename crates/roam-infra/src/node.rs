use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::InfrastructureError;
use crate::geo::GeoCoordinates;

/// Declared capacity per resource name. A value of `-1.0` means the capacity
/// is unlimited or unspecified; any other negative value is invalid.
pub type Resources = HashMap<String, f64>;

pub const UNLIMITED_CAPACITY: f64 = -1.0;

/// A single physical node of the infrastructure: the head of an area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// The name of the area this node heads. Unique across the tree.
    pub area_name: String,
    /// The host the node is reachable at. Unique across the tree.
    pub host: String,
    #[serde(default)]
    pub geo_coordinates: GeoCoordinates,
    #[serde(default)]
    pub resources: Resources,
}

impl Node {
    pub fn new(
        area_name: impl Into<String>,
        host: impl Into<String>,
        geo_coordinates: GeoCoordinates,
    ) -> Result<Self, InfrastructureError> {
        let node = Node {
            area_name: area_name.into(),
            host: host.into(),
            geo_coordinates,
            resources: Resources::new(),
        };
        node.validate()?;
        Ok(node)
    }

    pub fn validate(&self) -> Result<(), InfrastructureError> {
        if self.area_name.is_empty() {
            return Err(InfrastructureError::AreaNameEmpty);
        }
        if self.host.is_empty() {
            return Err(InfrastructureError::HostEmpty);
        }
        self.geo_coordinates.validate()?;
        for (resource, value) in &self.resources {
            if *value < 0.0 && *value != UNLIMITED_CAPACITY {
                return Err(InfrastructureError::ResourceValueNegative {
                    resource: resource.clone(),
                    value: *value,
                });
            }
        }
        Ok(())
    }
}
