//! Envoy resource bookkeeping: per key resource groups merged into one
//! versioned snapshot and served over ADS.

mod cache;
mod map;
mod resource_group;
mod server;

use envoy_types::pb::envoy::config::{
    cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
};
use prost::Message;
use thiserror::Error;

pub use cache::{NodeSnapshots, Snapshot, SnapshotCache};
pub use map::{InMemoryMap, ResourceMap};
pub use resource_group::ResourceGroup;
pub use server::AdsServer;

pub use envoy_types::pb::google::protobuf::Any;

/// Node id the proxy identifies itself with.
pub const DEFAULT_NODE_ID: &str = "proxy-0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to set snapshot version {version} for node {node_id}")]
    SetSnapshot {
        node_id: String,
        version: u64,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResourceType {
    Cluster,
    Listener,
    ClusterLoadAssignment,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Cluster,
        ResourceType::Listener,
        ResourceType::ClusterLoadAssignment,
    ];

    pub fn type_url(self) -> &'static str {
        match self {
            ResourceType::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceType::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            ResourceType::ClusterLoadAssignment => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
        }
    }

    pub fn from_type_url(url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.type_url() == url)
    }
}

/// A single xDS resource of any supported type.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Cluster(Cluster),
    Listener(Listener),
    LoadAssignment(ClusterLoadAssignment),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Cluster(_) => ResourceType::Cluster,
            Resource::Listener(_) => ResourceType::Listener,
            Resource::LoadAssignment(_) => ResourceType::ClusterLoadAssignment,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(c) => &c.name,
            Resource::Listener(l) => &l.name,
            Resource::LoadAssignment(cla) => &cla.cluster_name,
        }
    }

    pub fn to_any(&self) -> Any {
        let value = match self {
            Resource::Cluster(c) => c.encode_to_vec(),
            Resource::Listener(l) => l.encode_to_vec(),
            Resource::LoadAssignment(cla) => cla.encode_to_vec(),
        };
        Any {
            type_url: self.resource_type().type_url().to_string(),
            value,
        }
    }
}

/// Packs a typed config message (filters, access loggers) into an `Any`.
pub fn to_any<M: Message>(type_name: &str, message: &M) -> Any {
    Any {
        type_url: format!("type.googleapis.com/{type_name}"),
        value: message.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_round_trip() {
        for ty in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(ty.type_url()), Some(ty));
        }
        assert_eq!(
            ResourceType::from_type_url("type.googleapis.com/envoy.config.route.v3.RouteConfiguration"),
            None
        );
    }

    #[test]
    fn resource_any_uses_resource_type_url() {
        let cluster = Resource::Cluster(Cluster {
            name: "dns".into(),
            ..Default::default()
        });
        let any = cluster.to_any();
        assert_eq!(any.type_url, ResourceType::Cluster.type_url());
        assert_eq!(Cluster::decode(any.value.as_slice()).unwrap().name, "dns");
    }
}
