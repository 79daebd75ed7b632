//! Veth pair provisioning over rtnetlink.

use std::{
    net::{IpAddr, Ipv4Addr},
    os::fd::AsRawFd,
};

use anyhow::{Context, anyhow};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::{
    address::AddressAttribute,
    link::{LinkAttribute, LinkMessage},
    route::{RouteMessage, RouteScope},
};
use rand::RngCore;
use rtnetlink::Handle;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    datapath::{NatTables, Table},
    netns::NetNs,
};
use netglue_common::{DnatTarget, NetData, SnatTarget, VethPairEntry};

pub const VETH_MTU: u32 = 1500;

/// Fixed hardware address of every host peer. Hosts running an init system
/// that assigns persistent MACs to veths must have that disabled, otherwise it
/// races this assignment.
pub const HOST_VETH_MAC: [u8; 6] = [0x7e, 0x90, 0xc4, 0xed, 0xdf, 0xd0];

const IFACE_NAME_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open rtnetlink connection")]
    Connection(#[source] std::io::Error),
    #[error("failed to create veth pair {pod}/{host}")]
    Create {
        pod: String,
        host: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to move {iface} into {netns}")]
    MoveToNetns {
        iface: String,
        netns: String,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to configure {iface}")]
    Configure {
        iface: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to register veth pair of {host}")]
    Register {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to delete link {index}")]
    Delete {
        index: u32,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to {op} route to {dst}")]
    Route {
        op: &'static str,
        dst: Ipv4Net,
        #[source]
        source: anyhow::Error,
    },
}

/// One end of a veth pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VethPeer {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
    pub addr: Ipv4Net,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VethPair {
    pub host: VethPeer,
    pub pod: VethPeer,
}

/// Generates a 15 character interface name from 16 random bytes.
pub fn interface_name<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    let mut name: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    name.truncate(IFACE_NAME_LEN);
    name
}

fn connect() -> Result<Handle, LinkError> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(LinkError::Connection)?;
    tokio::spawn(conn);
    Ok(handle)
}

pub struct LinkProvisioner<R> {
    handle: Handle,
    rng: R,
}

impl<R: RngCore> LinkProvisioner<R> {
    /// Must be called from within a tokio runtime.
    pub fn new(rng: R) -> Result<Self, LinkError> {
        Ok(Self {
            handle: connect()?,
            rng,
        })
    }

    /// Creates a veth pair, moves the pod peer into `netns`, addresses both
    /// peers and registers the pair in the datapath tables.
    ///
    /// Nothing is rolled back on failure.
    pub async fn allocate<N, S, D, P>(
        &mut self,
        netns: &NetNs,
        host_addr: Ipv4Net,
        pod_addr: Ipv4Net,
        tables: &mut NatTables<N, S, D, P>,
    ) -> Result<VethPair, LinkError>
    where
        N: Table<u32, NetData>,
        S: Table<u8, SnatTarget>,
        D: Table<u16, DnatTarget>,
        P: Table<u32, VethPairEntry>,
    {
        let pod_name = interface_name(&mut self.rng);
        let host_name = interface_name(&mut self.rng);

        let mut add = self
            .handle
            .link()
            .add()
            .veth(pod_name.clone(), host_name.clone());
        add.message_mut()
            .attributes
            .push(LinkAttribute::Mtu(VETH_MTU));
        add.execute()
            .await
            .map_err(|source| LinkError::Create {
                pod: pod_name.clone(),
                host: host_name.clone(),
                source,
            })?;
        debug!(pod = %pod_name, host = %host_name, "veth pair created");

        let configure_err = |iface: &str| {
            let iface = iface.to_string();
            move |source| LinkError::Configure { iface, source }
        };

        let pod_link = find_link(&self.handle, &pod_name)
            .await
            .map_err(configure_err(&pod_name))?;
        self.handle
            .link()
            .set(pod_link.header.index)
            .setns_by_fd(netns.file().as_raw_fd())
            .execute()
            .await
            .map_err(|source| LinkError::MoveToNetns {
                iface: pod_name.clone(),
                netns: netns.path().display().to_string(),
                source,
            })?;

        let pod = {
            let name = pod_name.clone();
            netns
                .run_async(move || async move {
                    let handle = connect()?;
                    configure_peer(&handle, &name, pod_addr, None).await
                })
                .map_err(configure_err(&pod_name))?
        };

        let host = configure_peer(&self.handle, &host_name, host_addr, Some(HOST_VETH_MAC))
            .await
            .map_err(configure_err(&host_name))?;

        tables
            .add_veth_pair(host.index, pod.index, host.addr.addr())
            .map_err(|source| LinkError::Register {
                host: host_name.clone(),
                source,
            })?;

        info!(host = %host.name, pod = %pod.name, "veth pair allocated");
        Ok(VethPair { host, pod })
    }

    /// Deleting the host peer removes the pod peer with it.
    pub async fn delete(&self, host_index: u32) -> Result<(), LinkError> {
        self.handle
            .link()
            .del(host_index)
            .execute()
            .await
            .map_err(|source| LinkError::Delete {
                index: host_index,
                source,
            })
    }

    pub async fn link_name(&self, index: u32) -> anyhow::Result<String> {
        let link = self
            .handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_next()
            .await
            .with_context(|| format!("failed to get link {index}"))?
            .ok_or_else(|| anyhow!("link {index} not found"))?;
        link_attr_name(&link).ok_or_else(|| anyhow!("link {index} has no name"))
    }

    /// Installs the default route of the sandbox through the host peer.
    pub fn add_default_route(&self, veth: &VethPair, netns: &NetNs) -> Result<(), LinkError> {
        let gateway = veth.host.addr.addr();
        let pod_index = veth.pod.index;
        netns
            .run_async(move || async move {
                let handle = connect()?;
                handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(gateway, 32)
                    .output_interface(pod_index)
                    .scope(RouteScope::Link)
                    .execute()
                    .await
                    .context("gateway route")?;
                handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                    .gateway(gateway)
                    .output_interface(pod_index)
                    .execute()
                    .await
                    .context("default route")?;
                Ok(())
            })
            .map_err(|source| LinkError::Route {
                op: "add",
                dst: Ipv4Net::default(),
                source,
            })
    }

    /// Routes the exact pod address to the host peer.
    pub async fn add_full_match_route(&self, veth: &VethPair) -> Result<(), LinkError> {
        let dst = host_route(veth.pod.addr.addr());
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.addr(), dst.prefix_len())
            .output_interface(veth.host.index)
            .scope(RouteScope::Link)
            .execute()
            .await
            .map_err(|e| LinkError::Route {
                op: "add",
                dst,
                source: e.into(),
            })
    }

    pub async fn del_full_match_route(
        &self,
        pod_addr: Ipv4Addr,
        host_index: u32,
    ) -> Result<(), LinkError> {
        let dst = host_route(pod_addr);
        let message = self.full_match_route(dst, host_index);
        self.handle
            .route()
            .del(message)
            .execute()
            .await
            .map_err(|e| LinkError::Route {
                op: "delete",
                dst,
                source: e.into(),
            })
    }

    fn full_match_route(&self, dst: Ipv4Net, host_index: u32) -> RouteMessage {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.addr(), dst.prefix_len())
            .output_interface(host_index)
            .scope(RouteScope::Link);
        request.message_mut().clone()
    }
}

fn host_route(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

async fn find_link(handle: &Handle, name: &str) -> anyhow::Result<LinkMessage> {
    handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .with_context(|| format!("failed to get link {name}"))?
        .ok_or_else(|| anyhow!("link {name} not found"))
}

/// Assigns `addr`, optionally a MAC, brings the link up and reads it back.
async fn configure_peer(
    handle: &Handle,
    name: &str,
    addr: Ipv4Net,
    mac: Option<[u8; 6]>,
) -> anyhow::Result<VethPeer> {
    let index = find_link(handle, name).await?.header.index;

    handle
        .address()
        .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
        .execute()
        .await
        .with_context(|| format!("failed to add {addr}"))?;
    if let Some(mac) = mac {
        handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .context("failed to set hardware address")?;
    }
    handle
        .link()
        .set(index)
        .mtu(VETH_MTU)
        .up()
        .execute()
        .await
        .context("failed to set link up")?;

    let link = find_link(handle, name).await?;
    peer_from_link(name, &link, addr)
}

/// Index and first IPv4 address of the host interface `name`.
pub async fn interface_ipv4(name: &str) -> anyhow::Result<(u32, Ipv4Addr)> {
    let handle = connect()?;
    let index = find_link(&handle, name).await?.header.index;
    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(message) = addresses
        .try_next()
        .await
        .with_context(|| format!("failed to list addresses of {name}"))?
    {
        let addr = message.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Address(IpAddr::V4(addr)) => Some(*addr),
            _ => None,
        });
        if let Some(addr) = addr {
            return Ok((index, addr));
        }
    }
    Err(anyhow!("{name} has no IPv4 address"))
}

fn link_attr_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn peer_from_link(name: &str, link: &LinkMessage, addr: Ipv4Net) -> anyhow::Result<VethPeer> {
    let mac = link
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::Address(bytes) => <[u8; 6]>::try_from(bytes.as_slice()).ok(),
            _ => None,
        })
        .ok_or_else(|| anyhow!("link {name} has no hardware address"))?;
    Ok(VethPeer {
        name: name.to_string(),
        index: link.header.index,
        mac,
        addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn interface_names_are_short_hex() {
        let mut rng = StepRng::new(0xdead_beef, 0x1111);
        let pod = interface_name(&mut rng);
        let host = interface_name(&mut rng);

        assert_eq!(pod.len(), 15);
        assert_eq!(host.len(), 15);
        assert!(pod.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(pod, host);
    }

    #[test]
    fn interface_names_follow_the_rng() {
        let a = interface_name(&mut StepRng::new(7, 3));
        let b = interface_name(&mut StepRng::new(7, 3));
        assert_eq!(a, b);
    }

    #[test]
    fn peer_reads_index_and_mac() {
        let mut link = LinkMessage::default();
        link.header.index = 12;
        link.attributes.push(LinkAttribute::IfName("abc".into()));
        link.attributes
            .push(LinkAttribute::Address(HOST_VETH_MAC.to_vec()));
        let addr: Ipv4Net = "10.0.0.1/24".parse().unwrap();

        let peer = peer_from_link("abc", &link, addr).unwrap();

        assert_eq!(peer.index, 12);
        assert_eq!(peer.mac, HOST_VETH_MAC);
        assert_eq!(peer.addr, addr);
        assert_eq!(link_attr_name(&link).as_deref(), Some("abc"));
    }

    #[test]
    fn peer_without_mac_is_rejected() {
        let link = LinkMessage::default();
        let addr: Ipv4Net = "10.0.0.2/24".parse().unwrap();
        assert!(peer_from_link("abc", &link, addr).is_err());
    }

    #[test]
    fn full_match_route_is_host_prefix() {
        let dst = host_route(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(dst.prefix_len(), 32);
        assert_eq!(dst.addr(), Ipv4Addr::new(10, 0, 0, 2));
    }
}
