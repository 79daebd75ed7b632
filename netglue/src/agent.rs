//! The node agent: owns the node wide datapath programs and serves the
//! management API until interrupted.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use tokio::signal;
use tracing::info;

use crate::{
    api,
    datapath::{Datapath, DatapathConfig, PinnedNatTables},
    link,
    proxy::{ProxyConfig, ProxyService, Service},
    xds::{AdsServer, InMemoryMap, NodeSnapshots},
};

pub const DEFAULT_LISTEN_SOCK: &str = "/run/netglue/netglued.sock";
pub const DEFAULT_CGROUP: &str = "/sys/fs/cgroup";

/// SNAT slot of the node's uplink address.
const NODE_SNAT_SLOT: u8 = 0;

pub struct AgentOptions {
    pub listen_sock: PathBuf,
    pub host_iface: String,
    pub cgroup: PathBuf,
    pub objects_dir: PathBuf,
    pub node_id: String,
    pub proxy: ProxyConfig,
}

pub async fn run(opts: AgentOptions) -> Result<()> {
    let mut datapath = Datapath::load(DatapathConfig::new(opts.objects_dir))?;
    datapath.attach_node_iface(&opts.host_iface)?;

    let (index, addr) = link::interface_ipv4(&opts.host_iface).await?;
    let if_index = u8::try_from(index).map_err(|_| {
        anyhow!(
            "{} has index {index}, too large for the NAT tables",
            opts.host_iface
        )
    })?;
    PinnedNatTables::open(&datapath.config().map_pin_dir)?
        .add_snat_target(NODE_SNAT_SLOT, addr, if_index)
        .context("failed to register node SNAT target")?;
    info!(iface = %opts.host_iface, %addr, index, "node SNAT target set");

    datapath.attach_getsockopt(&opts.cgroup)?;

    let snapshots = NodeSnapshots::new();
    let map = InMemoryMap::new(opts.node_id.clone(), snapshots.clone());
    let service = Arc::new(Service::new(map, opts.proxy));
    service.apply_global_resources()?;

    info!(node_id = %opts.node_id, "node agent ready");
    api::serve(
        &opts.listen_sock,
        service,
        AdsServer::new(snapshots),
        async {
            let _ = signal::ctrl_c().await;
            info!("shutting down");
        },
    )
    .await?;

    // Links attached by the agent go away with the programs.
    drop(datapath);
    Ok(())
}
