use std::net::SocketAddr;

use envoy_types::pb::envoy::{
    config::{
        core::v3::{
            Address, SocketAddress, address,
            socket_address::{PortSpecifier, Protocol},
        },
        listener::v3::{Filter, FilterChain, ListenerFilter, filter, listener_filter},
    },
    extensions::filters::{
        listener::original_dst::v3::OriginalDst,
        network::tcp_proxy::v3::{TcpProxy, tcp_proxy},
    },
};

use crate::xds::to_any;

pub const ORIGINAL_DST_FILTER: &str = "envoy.filters.listener.original_dst";
pub const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";

pub fn socket_address(addr: SocketAddr, protocol: Protocol) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: protocol as i32,
            address: addr.ip().to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(addr.port()))),
            ..Default::default()
        })),
    }
}

/// Listener filter restoring the pre-redirect destination of a connection.
pub fn original_dst_filter() -> ListenerFilter {
    ListenerFilter {
        name: ORIGINAL_DST_FILTER.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(to_any(
            "envoy.extensions.filters.listener.original_dst.v3.OriginalDst",
            &OriginalDst::default(),
        ))),
        ..Default::default()
    }
}

pub fn tcp_proxy_chain(stat_prefix: &str, cluster: &str) -> FilterChain {
    let tcp_proxy = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(tcp_proxy::ClusterSpecifier::Cluster(cluster.to_string())),
        ..Default::default()
    };
    FilterChain {
        filters: vec![Filter {
            name: TCP_PROXY_FILTER.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(to_any(
                "envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy",
                &tcp_proxy,
            ))),
        }],
        ..Default::default()
    }
}
