use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use tracing::debug;

use crate::{
    datapath::{self, DatapathConfig, PinnedNatTables, addr_to_key, key_to_addr},
    ipam::{self, ExecEnv},
    link::{LinkProvisioner, VethPair},
    netns::NetNs,
};
use netglue_common::NetData;

/// Kernel facing steps of attaching and detaching a workload.
#[async_trait]
pub trait Handler: Send {
    async fn allocate_addresses(&mut self, plugin: &str, stdin: &[u8]) -> Result<Vec<Ipv4Net>>;
    async fn deallocate_addresses(&mut self, plugin: &str, stdin: &[u8]) -> Result<()>;
    async fn allocate_link(
        &mut self,
        netns: &str,
        host_addr: Ipv4Net,
        pod_addr: Ipv4Net,
    ) -> Result<VethPair>;
    async fn attach_host_programs(&mut self, veth: &VethPair) -> Result<()>;
    async fn attach_sandbox_programs(&mut self, veth: &VethPair, netns: &str) -> Result<()>;
    async fn add_default_route(&mut self, veth: &VethPair, netns: &str) -> Result<()>;
    async fn add_full_match_route(&mut self, veth: &VethPair) -> Result<()>;
    async fn add_redirect_target(&mut self, veth: &VethPair, host_port: u16) -> Result<()>;
    async fn add_net_data(&mut self, veth: &VethPair, host_port: u16) -> Result<()>;

    /// Recovers what [`Handler::allocate_link`] set up from the NAT tables.
    async fn lookup_link(&mut self, host_port: u16) -> Result<AttachedLink>;
    async fn del_full_match_route(&mut self, link: &AttachedLink) -> Result<()>;
    async fn del_table_entries(&mut self, link: &AttachedLink, host_port: u16) -> Result<()>;
    async fn deallocate_link(&mut self, link: &AttachedLink) -> Result<()>;
}

/// Client of the node agent's proxy control service.
#[async_trait]
pub trait ProxyNotifier: Send + Sync {
    async fn create_listeners(&self, workload_id: &str, addr: Ipv4Addr) -> Result<()>;
    async fn delete_listeners(&self, workload_id: &str) -> Result<()>;
}

/// A veth pair as recorded in the datapath tables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttachedLink {
    pub host_index: u32,
    pub pod_index: u32,
    pub pod_addr: Ipv4Addr,
    pub net_data: NetData,
}

/// [`Handler`] backed by rtnetlink, the pinned datapath maps and a delegated
/// IPAM plugin.
pub struct NodeHandler {
    links: LinkProvisioner<OsRng>,
    tables: PinnedNatTables,
    datapath: DatapathConfig,
    env: ExecEnv,
}

impl NodeHandler {
    /// Must be called from within a tokio runtime.
    pub fn new(datapath: DatapathConfig, env: ExecEnv) -> Result<Self> {
        let tables = PinnedNatTables::open(&datapath.map_pin_dir)
            .context("datapath maps are not pinned, is netglued running?")?;
        Ok(Self {
            links: LinkProvisioner::new(OsRng)?,
            tables,
            datapath,
            env,
        })
    }
}

fn table_index(index: u32) -> Result<u8> {
    u8::try_from(index).map_err(|_| anyhow!("interface index {index} does not fit the NAT tables"))
}

#[async_trait]
impl Handler for NodeHandler {
    async fn allocate_addresses(&mut self, plugin: &str, stdin: &[u8]) -> Result<Vec<Ipv4Net>> {
        ipam::exec_add(plugin, stdin, &self.env).await
    }

    async fn deallocate_addresses(&mut self, plugin: &str, stdin: &[u8]) -> Result<()> {
        ipam::exec_del(plugin, stdin, &self.env).await
    }

    async fn allocate_link(
        &mut self,
        netns: &str,
        host_addr: Ipv4Net,
        pod_addr: Ipv4Net,
    ) -> Result<VethPair> {
        let netns = NetNs::open(netns)?;
        Ok(self
            .links
            .allocate(&netns, host_addr, pod_addr, &mut self.tables)
            .await?)
    }

    async fn attach_host_programs(&mut self, veth: &VethPair) -> Result<()> {
        datapath::attach_host_peer(&self.datapath, &veth.host.name)
    }

    async fn attach_sandbox_programs(&mut self, veth: &VethPair, netns: &str) -> Result<()> {
        let config = &self.datapath;
        NetNs::open(netns)?
            .run(|| datapath::attach_pod_peer(config, &veth.pod.name, &veth.host.name))
    }

    async fn add_default_route(&mut self, veth: &VethPair, netns: &str) -> Result<()> {
        let netns = NetNs::open(netns)?;
        Ok(self.links.add_default_route(veth, &netns)?)
    }

    async fn add_full_match_route(&mut self, veth: &VethPair) -> Result<()> {
        Ok(self.links.add_full_match_route(veth).await?)
    }

    async fn add_redirect_target(&mut self, veth: &VethPair, host_port: u16) -> Result<()> {
        self.tables.add_dnat_target(
            host_port,
            veth.pod.addr.addr(),
            table_index(veth.host.index)?,
            veth.pod.mac,
        )
    }

    async fn add_net_data(&mut self, veth: &VethPair, host_port: u16) -> Result<()> {
        let data = NetData {
            pod_addr: addr_to_key(veth.pod.addr.addr()),
            if_index: table_index(veth.pod.index)?,
            mac: veth.pod.mac,
            pad: 0,
        };
        self.tables.add_net_data(host_port, data)
    }

    async fn lookup_link(&mut self, host_port: u16) -> Result<AttachedLink> {
        let dnat = self
            .tables
            .dnat_target(host_port)?
            .ok_or_else(|| anyhow!("no redirect target for port {host_port}"))?;
        let net_data = self
            .tables
            .net_data(host_port)?
            .ok_or_else(|| anyhow!("no net data for port {host_port}"))?;
        let link = AttachedLink {
            host_index: u32::from(dnat.if_index),
            pod_index: u32::from(net_data.if_index),
            pod_addr: key_to_addr(net_data.pod_addr),
            net_data,
        };
        debug!(?link, port = host_port, "link resolved");
        Ok(link)
    }

    async fn del_full_match_route(&mut self, link: &AttachedLink) -> Result<()> {
        Ok(self
            .links
            .del_full_match_route(link.pod_addr, link.host_index)
            .await?)
    }

    async fn del_table_entries(&mut self, link: &AttachedLink, host_port: u16) -> Result<()> {
        let results = [
            self.tables.del_dnat_target(host_port).context("redirect target"),
            self.tables
                .del_net_data(host_port, link.net_data)
                .context("net data"),
            self.tables
                .del_veth_pair(link.host_index, link.pod_index)
                .context("veth pair"),
        ];
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|err| format!("{err:#}")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    async fn deallocate_link(&mut self, link: &AttachedLink) -> Result<()> {
        let host_name = self.links.link_name(link.host_index).await?;
        self.links.delete(link.host_index).await?;
        datapath::unpin_links(&self.datapath, &host_name)
    }
}
