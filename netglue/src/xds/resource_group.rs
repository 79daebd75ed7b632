use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::{
    cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
};

use super::{Resource, ResourceType};

/// Bundle of resources owned by one key (a workload id or `global`).
/// Replaced wholesale on every update of that key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceGroup {
    pub clusters: Vec<Cluster>,
    pub listeners: Vec<Listener>,
    pub load_assignments: Vec<ClusterLoadAssignment>,
}

impl ResourceGroup {
    /// Flattens the group into resources keyed by type. Every type is
    /// present, possibly with no resources.
    pub fn resources_by_type(&self) -> BTreeMap<ResourceType, Vec<Resource>> {
        let mut out = BTreeMap::new();
        out.insert(
            ResourceType::Cluster,
            self.clusters.iter().cloned().map(Resource::Cluster).collect(),
        );
        out.insert(
            ResourceType::Listener,
            self.listeners.iter().cloned().map(Resource::Listener).collect(),
        );
        out.insert(
            ResourceType::ClusterLoadAssignment,
            self.load_assignments
                .iter()
                .cloned()
                .map(Resource::LoadAssignment)
                .collect(),
        );
        out
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.listeners.is_empty() && self.load_assignments.is_empty()
    }
}
