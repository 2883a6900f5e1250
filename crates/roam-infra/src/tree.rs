use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::InfrastructureError;
use crate::node::Node;

// ── Area ──────────────────────────────────────────────────────────────────────

/// A named subtree of the infrastructure: one node plus its sub-areas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub areas: Vec<Area>,
}

impl Area {
    /// All areas of this subtree in DFS pre-order, `self` first.
    pub fn flatten(&self) -> Vec<&Area> {
        let mut areas = vec![self];
        for sub_area in &self.areas {
            areas.extend(sub_area.flatten());
        }
        areas
    }

    fn check(
        &self,
        depth_left: usize,
        names: &mut HashSet<String>,
        hosts: &mut HashSet<String>,
    ) -> Result<(), InfrastructureError> {
        self.node.validate()?;

        if depth_left == 0 {
            return Err(InfrastructureError::AreaMaxDepth);
        }
        if !names.insert(self.node.area_name.clone()) {
            return Err(InfrastructureError::AreaNameNotUnique(
                self.node.area_name.clone(),
            ));
        }
        if !hosts.insert(self.node.host.clone()) {
            return Err(InfrastructureError::HostNotUnique(self.node.host.clone()));
        }

        for sub_area in &self.areas {
            sub_area.check(depth_left - 1, names, hosts)?;
        }
        Ok(())
    }
}

// ── Infrastructure ────────────────────────────────────────────────────────────

/// The static topology loaded at boot: the declared hierarchy levels and the
/// forest of areas. Immutable once validated; reloads replace the whole
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    /// Names of the hierarchy levels, outermost first. The tree may not be
    /// deeper than this list.
    pub area_identifiers: Vec<String>,
    pub areas: Vec<Area>,
}

impl Infrastructure {
    pub fn new(
        area_identifiers: Vec<String>,
        areas: Vec<Area>,
    ) -> Result<Self, InfrastructureError> {
        let infrastructure = Infrastructure { area_identifiers, areas };
        infrastructure.validate()?;
        Ok(infrastructure)
    }

    pub fn validate(&self) -> Result<(), InfrastructureError> {
        if self.area_identifiers.is_empty() {
            return Err(InfrastructureError::IdentifiersEmpty);
        }
        let mut identifiers = HashSet::new();
        for identifier in &self.area_identifiers {
            if identifier.is_empty() {
                return Err(InfrastructureError::IdentifierEmpty);
            }
            if !identifiers.insert(identifier.clone()) {
                return Err(InfrastructureError::IdentifiersNotUnique(identifier.clone()));
            }
        }

        let mut names = HashSet::new();
        let mut hosts = HashSet::new();
        for area in &self.areas {
            area.check(self.area_identifiers.len(), &mut names, &mut hosts)?;
        }
        Ok(())
    }

    /// Parse and validate. Invalid topologies never become values.
    pub fn from_json(data: &[u8]) -> Result<Self, InfrastructureError> {
        let infrastructure: Infrastructure = serde_json::from_slice(data)?;
        infrastructure.validate()?;
        Ok(infrastructure)
    }

    /// Validate and serialize.
    pub fn to_json(&self) -> Result<Vec<u8>, InfrastructureError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// All areas in DFS pre-order.
    pub fn flatten(&self) -> Vec<&Area> {
        let mut areas = Vec::new();
        for area in &self.areas {
            areas.extend(area.flatten());
        }
        areas
    }

    /// The area with the given name, together with its ancestor chain
    /// (root first, the area's direct parent last).
    pub fn lookup(&self, area_name: &str) -> Option<(&Area, Vec<&Area>)> {
        fn find<'a>(
            areas: &'a [Area],
            name: &str,
            chain: &mut Vec<&'a Area>,
        ) -> Option<&'a Area> {
            for area in areas {
                if area.node.area_name == name {
                    return Some(area);
                }
                chain.push(area);
                if let Some(found) = find(&area.areas, name, chain) {
                    return Some(found);
                }
                chain.pop();
            }
            None
        }

        let mut chain = Vec::new();
        find(&self.areas, area_name, &mut chain).map(|area| (area, chain))
    }

    pub fn node_by_host(&self, host: &str) -> Option<&Node> {
        self.flatten()
            .into_iter()
            .find(|area| area.node.host == host)
            .map(|area| &area.node)
    }

    /// The node whose area directly contains `host`. None for roots and
    /// unknown hosts.
    pub fn parent_of(&self, host: &str) -> Option<&Node> {
        self.flatten()
            .into_iter()
            .find(|area| area.areas.iter().any(|sub| sub.node.host == host))
            .map(|area| &area.node)
    }

    pub fn children_of(&self, host: &str) -> Vec<&Node> {
        self.flatten()
            .into_iter()
            .find(|area| area.node.host == host)
            .map(|area| area.areas.iter().map(|sub| &sub.node).collect())
            .unwrap_or_default()
    }

    /// The deepest area whose subtree contains every given host. None when
    /// the hosts span different roots or are unknown.
    pub fn common_ancestor(&self, hosts: &[&str]) -> Option<&Area> {
        fn contains_host(area: &Area, host: &str) -> bool {
            area.node.host == host || area.areas.iter().any(|sub| contains_host(sub, host))
        }
        fn descend<'a>(area: &'a Area, hosts: &[&str]) -> Option<&'a Area> {
            if !hosts.iter().all(|host| contains_host(area, host)) {
                return None;
            }
            for sub_area in &area.areas {
                if let Some(deeper) = descend(sub_area, hosts) {
                    return Some(deeper);
                }
            }
            Some(area)
        }

        if hosts.is_empty() {
            return None;
        }
        self.areas.iter().find_map(|root| descend(root, hosts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infra_json() -> &'static str {
        r#"{
            "areaIdentifiers": ["continent", "country", "city"],
            "areas": [{
                "areaName": "europe", "host": "eu.example.org",
                "geoCoordinates": {"latitude": 50.0, "longitude": 9.0},
                "areas": [
                    {
                        "areaName": "italy", "host": "it.example.org",
                        "geoCoordinates": {"latitude": 42.5, "longitude": 12.5},
                        "areas": [
                            {"areaName": "milan", "host": "mi.example.org",
                             "geoCoordinates": {"latitude": 45.46, "longitude": 9.19},
                             "resources": {"cpu": 8.0, "memory": 16.0}},
                            {"areaName": "rome", "host": "rm.example.org",
                             "geoCoordinates": {"latitude": 41.9, "longitude": 12.5},
                             "resources": {"cpu": 4.0, "memory": 8.0}}
                        ]
                    },
                    {
                        "areaName": "norway", "host": "no.example.org",
                        "geoCoordinates": {"latitude": 60.5, "longitude": 8.5},
                        "areas": [
                            {"areaName": "oslo", "host": "os.example.org",
                             "geoCoordinates": {"latitude": 59.9, "longitude": 10.7}}
                        ]
                    }
                ]
            }]
        }"#
    }

    #[test]
    fn valid_tree_loads() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        assert_eq!(infrastructure.flatten().len(), 6);
    }

    #[test]
    fn flatten_is_dfs_pre_order() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        let names: Vec<&str> = infrastructure
            .flatten()
            .iter()
            .map(|area| area.node.area_name.as_str())
            .collect();
        assert_eq!(names, ["europe", "italy", "milan", "rome", "norway", "oslo"]);
    }

    #[test]
    fn validation_is_idempotent_and_marshal_matches_plain_json() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        infrastructure.validate().unwrap();
        infrastructure.validate().unwrap();
        assert_eq!(
            infrastructure.to_json().unwrap(),
            serde_json::to_vec(&infrastructure).unwrap()
        );
    }

    #[test]
    fn lookup_returns_parent_chain() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        let (area, chain) = infrastructure.lookup("milan").unwrap();
        assert_eq!(area.node.host, "mi.example.org");
        let chain_names: Vec<&str> =
            chain.iter().map(|a| a.node.area_name.as_str()).collect();
        assert_eq!(chain_names, ["europe", "italy"]);
    }

    #[test]
    fn parent_and_children_by_host() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        assert_eq!(
            infrastructure.parent_of("mi.example.org").unwrap().host,
            "it.example.org"
        );
        assert!(infrastructure.parent_of("eu.example.org").is_none());
        let children = infrastructure.children_of("it.example.org");
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn common_ancestor_is_deepest_covering_area() {
        let infrastructure = Infrastructure::from_json(infra_json().as_bytes()).unwrap();
        let lca = infrastructure
            .common_ancestor(&["mi.example.org", "rm.example.org"])
            .unwrap();
        assert_eq!(lca.node.area_name, "italy");
        let lca = infrastructure
            .common_ancestor(&["mi.example.org", "os.example.org"])
            .unwrap();
        assert_eq!(lca.node.area_name, "europe");
        assert!(infrastructure.common_ancestor(&["nowhere"]).is_none());
    }

    #[test]
    fn depth_equal_to_identifiers_allowed_one_deeper_rejected() {
        let three_deep = infra_json();
        assert!(Infrastructure::from_json(three_deep.as_bytes()).is_ok());

        let infrastructure: Infrastructure =
            serde_json::from_slice(three_deep.as_bytes()).unwrap();
        let shallow = Infrastructure {
            area_identifiers: vec!["continent".into(), "country".into()],
            areas: infrastructure.areas,
        };
        assert!(matches!(
            shallow.validate(),
            Err(InfrastructureError::AreaMaxDepth)
        ));
    }

    #[test]
    fn duplicate_area_name_across_branches_rejected() {
        let json = r#"{
            "areaIdentifiers": ["l1", "l2"],
            "areas": [
                {"areaName": "a", "host": "h1",
                 "areas": [{"areaName": "leaf", "host": "h2"}]},
                {"areaName": "b", "host": "h3",
                 "areas": [{"areaName": "leaf", "host": "h4"}]}
            ]
        }"#;
        assert!(matches!(
            Infrastructure::from_json(json.as_bytes()),
            Err(InfrastructureError::AreaNameNotUnique(name)) if name == "leaf"
        ));
    }

    #[test]
    fn duplicate_host_rejected() {
        let json = r#"{
            "areaIdentifiers": ["l1", "l2"],
            "areas": [{"areaName": "a", "host": "h1",
                       "areas": [{"areaName": "b", "host": "h1"}]}]
        }"#;
        assert!(matches!(
            Infrastructure::from_json(json.as_bytes()),
            Err(InfrastructureError::HostNotUnique(host)) if host == "h1"
        ));
    }

    #[test]
    fn identifier_rules_enforced() {
        let no_identifiers = Infrastructure {
            area_identifiers: vec![],
            areas: vec![],
        };
        assert!(matches!(
            no_identifiers.validate(),
            Err(InfrastructureError::IdentifiersEmpty)
        ));

        let empty_identifier = Infrastructure {
            area_identifiers: vec!["l1".into(), "".into()],
            areas: vec![],
        };
        assert!(matches!(
            empty_identifier.validate(),
            Err(InfrastructureError::IdentifierEmpty)
        ));

        let duplicated = Infrastructure {
            area_identifiers: vec!["l1".into(), "l1".into()],
            areas: vec![],
        };
        assert!(matches!(
            duplicated.validate(),
            Err(InfrastructureError::IdentifiersNotUnique(_))
        ));
    }
}
