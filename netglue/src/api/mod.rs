//! Management API of the node agent: `platformd.proxy.v1alpha1.ProxyService`
//! served over a unix socket next to the aggregated discovery service.

mod client;
mod server;

pub use client::GrpcNotifier;
pub use server::{ProxyServer, serve};

include!(concat!(
    env!("OUT_DIR"),
    "/platformd.proxy.v1alpha1.ProxyService.rs"
));

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateListenersRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    #[prost(string, tag = "2")]
    pub ip: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct CreateListenersResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteListenersRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DeleteListenersResponse {}
