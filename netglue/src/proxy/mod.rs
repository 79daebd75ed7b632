//! Translates workloads into proxy resources and applies them to the
//! resource map.

mod dns;
mod filters;
mod service;
mod workload;

use std::net::IpAddr;

use thiserror::Error;

use crate::xds;

pub use dns::{DNS_CLUSTER, DNS_PORT, dns_cluster, dns_resources};
pub use service::{ProxyConfig, Service};
pub use workload::{
    HTTP_PORT, ORIGINAL_DST_CLUSTER, TCP_PORT, original_dst_cluster, workload_resources,
};

/// Key of the resource group that is not owned by any workload.
pub const GLOBAL_KEY: &str = "global";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to apply global resources")]
    ApplyGlobal(#[source] xds::Error),
    #[error("failed to create listeners for workload {workload_id}")]
    CreateListeners {
        workload_id: String,
        #[source]
        source: xds::Error,
    },
    #[error("failed to delete listeners of workload {workload_id}")]
    DeleteListeners {
        workload_id: String,
        #[source]
        source: xds::Error,
    },
}

pub trait ProxyService: Send + Sync {
    fn apply_global_resources(&self) -> Result<(), Error>;
    fn create_listeners(&self, workload_id: &str, addr: IpAddr) -> Result<(), Error>;
    fn delete_listeners(&self, workload_id: &str) -> Result<(), Error>;
}
