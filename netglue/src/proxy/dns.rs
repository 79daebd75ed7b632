use std::net::SocketAddr;

use envoy_types::pb::{
    envoy::{
        config::{
            cluster::v3::{Cluster, cluster},
            core::v3::{
                AggregatedConfigSource, ConfigSource, UdpSocketConfig, config_source,
                socket_address::Protocol,
            },
            endpoint::v3::{
                ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints, lb_endpoint,
            },
            listener::v3::{Listener, ListenerFilter, UdpListenerConfig, listener_filter},
        },
        extensions::filters::udp::udp_proxy::v3::{
            Route as UdpRoute, UdpProxyConfig, udp_proxy_config,
        },
    },
    google::protobuf::UInt64Value,
    xds::{
        core::v3::TypedExtensionConfig,
        r#type::matcher::v3::{Matcher, matcher},
    },
};

use super::filters::{socket_address, tcp_proxy_chain};
use crate::xds::{ResourceGroup, to_any};

pub const DNS_CLUSTER: &str = "dns";
pub const DNS_PORT: u16 = 9053;

const UDP_PROXY_FILTER: &str = "envoy.filters.udp_listener.udp_proxy";
const MAX_RX_DATAGRAM_SIZE: u64 = 9000;

/// Upstream DNS cluster. Endpoints arrive over EDS through the aggregated
/// stream, see [`dns_resources`].
pub fn dns_cluster() -> Cluster {
    Cluster {
        name: DNS_CLUSTER.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            eds_config: Some(ConfigSource {
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                ..Default::default()
            }),
            ..Default::default()
        }),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        ..Default::default()
    }
}

/// UDP and TCP listeners on `listen` forwarding to `cluster`, plus one load
/// assignment per protocol pointing at `upstream`.
pub fn dns_resources(cluster: &str, listen: SocketAddr, upstream: SocketAddr) -> ResourceGroup {
    ResourceGroup {
        listeners: vec![udp_listener(cluster, listen), tcp_listener(cluster, listen)],
        load_assignments: vec![
            load_assignment(cluster, upstream, Protocol::Udp),
            load_assignment(cluster, upstream, Protocol::Tcp),
        ],
        ..Default::default()
    }
}

fn socket_config() -> UdpSocketConfig {
    UdpSocketConfig {
        max_rx_datagram_size: Some(UInt64Value {
            value: MAX_RX_DATAGRAM_SIZE,
        }),
        ..Default::default()
    }
}

fn udp_listener(cluster: &str, listen: SocketAddr) -> Listener {
    let route = TypedExtensionConfig {
        name: "route".to_string(),
        typed_config: Some(to_any(
            "envoy.extensions.filters.udp.udp_proxy.v3.Route",
            &UdpRoute {
                cluster: cluster.to_string(),
            },
        )),
    };
    let udp_proxy = UdpProxyConfig {
        stat_prefix: "dns_udp_proxy".to_string(),
        route_specifier: Some(udp_proxy_config::RouteSpecifier::Matcher(Matcher {
            on_no_match: Some(Box::new(matcher::OnMatch {
                on_match: Some(matcher::on_match::OnMatch::Action(route)),
                ..Default::default()
            })),
            ..Default::default()
        })),
        upstream_socket_config: Some(socket_config()),
        ..Default::default()
    };

    Listener {
        name: "dns_udp".to_string(),
        address: Some(socket_address(listen, Protocol::Udp)),
        listener_filters: vec![ListenerFilter {
            name: UDP_PROXY_FILTER.to_string(),
            config_type: Some(listener_filter::ConfigType::TypedConfig(to_any(
                "envoy.extensions.filters.udp.udp_proxy.v3.UdpProxyConfig",
                &udp_proxy,
            ))),
            ..Default::default()
        }],
        udp_listener_config: Some(UdpListenerConfig {
            downstream_socket_config: Some(socket_config()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_listener(cluster: &str, listen: SocketAddr) -> Listener {
    Listener {
        name: "dns_tcp".to_string(),
        address: Some(socket_address(listen, Protocol::Tcp)),
        filter_chains: vec![tcp_proxy_chain("dns_tcp_proxy", cluster)],
        ..Default::default()
    }
}

fn load_assignment(
    cluster: &str,
    upstream: SocketAddr,
    protocol: Protocol,
) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![LbEndpoint {
                host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                    address: Some(socket_address(upstream, protocol)),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}
