use std::net::{IpAddr, SocketAddr};

use envoy_types::pb::{
    envoy::{
        config::{
            accesslog::v3::{AccessLog, access_log},
            cluster::v3::{Cluster, cluster},
            core::v3::{
                JsonFormatOptions, SubstitutionFormatString, socket_address::Protocol,
                substitution_format_string,
            },
            listener::v3::{Filter, FilterChain, Listener, filter},
            route::v3::{
                Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost, route,
                route_action, route_match,
            },
        },
        extensions::{
            access_loggers::stream::v3::{StdoutAccessLog, stdout_access_log},
            filters::{
                http::router::v3::Router,
                network::http_connection_manager::v3::{
                    HttpConnectionManager, HttpFilter, http_connection_manager, http_filter,
                },
            },
        },
    },
    google::protobuf::{Duration, Struct},
};

use super::filters::{original_dst_filter, socket_address, tcp_proxy_chain};
use crate::xds::{ResourceGroup, to_any};

pub const TCP_PORT: u16 = 9090;
pub const HTTP_PORT: u16 = 9080;
pub const ORIGINAL_DST_CLUSTER: &str = "original_dst";

const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const ACCESS_LOG: &str = "json_stdout_access_log";

/// Cluster forwarding intercepted connections to their original destination.
pub fn original_dst_cluster() -> Cluster {
    Cluster {
        name: ORIGINAL_DST_CLUSTER.to_string(),
        connect_timeout: Some(Duration {
            seconds: 5,
            nanos: 0,
        }),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::OriginalDst as i32,
        )),
        lb_policy: cluster::LbPolicy::ClusterProvided as i32,
        dns_lookup_family: cluster::DnsLookupFamily::V4Only as i32,
        ..Default::default()
    }
}

/// Listeners intercepting a workload's traffic, bound to the host peer
/// address. Names carry the workload id since they identify the listener in
/// the proxy.
pub fn workload_resources(workload_id: &str, addr: IpAddr, cluster: &str) -> ResourceGroup {
    ResourceGroup {
        listeners: vec![
            tcp_listener(workload_id, SocketAddr::new(addr, TCP_PORT), cluster),
            http_listener(workload_id, SocketAddr::new(addr, HTTP_PORT), cluster),
        ],
        ..Default::default()
    }
}

fn tcp_listener(workload_id: &str, addr: SocketAddr, cluster: &str) -> Listener {
    Listener {
        name: format!("tcp-{workload_id}"),
        address: Some(socket_address(addr, Protocol::Tcp)),
        filter_chains: vec![tcp_proxy_chain(workload_id, cluster)],
        listener_filters: vec![original_dst_filter()],
        ..Default::default()
    }
}

fn http_listener(workload_id: &str, addr: SocketAddr, cluster: &str) -> Listener {
    let hcm = HttpConnectionManager {
        stat_prefix: workload_id.to_string(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(
            catch_all_route(cluster),
        )),
        http_filters: vec![HttpFilter {
            name: ROUTER_FILTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
                "envoy.extensions.filters.http.router.v3.Router",
                &Router::default(),
            ))),
            ..Default::default()
        }],
        access_log: vec![json_stdout_access_log()],
        ..Default::default()
    };

    Listener {
        name: format!("http-{workload_id}"),
        address: Some(socket_address(addr, Protocol::Tcp)),
        stat_prefix: workload_id.to_string(),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HCM_FILTER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(to_any(
                    "envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                    &hcm,
                ))),
            }],
            ..Default::default()
        }],
        listener_filters: vec![original_dst_filter()],
        ..Default::default()
    }
}

/// Static route table; never refreshed through RDS.
fn catch_all_route(cluster: &str) -> RouteConfiguration {
    RouteConfiguration {
        name: "public".to_string(),
        virtual_hosts: vec![VirtualHost {
            name: "all".to_string(),
            domains: vec!["*".to_string()],
            routes: vec![Route {
                r#match: Some(RouteMatch {
                    path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
                    ..Default::default()
                }),
                action: Some(route::Action::Route(RouteAction {
                    cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                        cluster.to_string(),
                    )),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn json_stdout_access_log() -> AccessLog {
    let stdout = StdoutAccessLog {
        access_log_format: Some(stdout_access_log::AccessLogFormat::LogFormat(
            SubstitutionFormatString {
                format: Some(substitution_format_string::Format::JsonFormat(
                    Struct::default(),
                )),
                omit_empty_values: true,
                json_format_options: Some(JsonFormatOptions {
                    sort_properties: true,
                }),
                ..Default::default()
            },
        )),
    };
    AccessLog {
        name: ACCESS_LOG.to_string(),
        config_type: Some(access_log::ConfigType::TypedConfig(to_any(
            "envoy.extensions.access_loggers.stream.v3.StdoutAccessLog",
            &stdout,
        ))),
        ..Default::default()
    }
}
