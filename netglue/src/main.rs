use std::{net::SocketAddr, path::PathBuf, process::exit};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};

use netglue::{
    agent::{self, AgentOptions},
    datapath::DEFAULT_OBJECTS_DIR,
    proxy::ProxyConfig,
    xds::DEFAULT_NODE_ID,
};

#[derive(Parser)]
#[command(name = "netglued")]
#[command(about = "netglue node agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the datapath and serve the proxy control API
    Node(NodeCommand),
}

#[derive(Args)]
struct NodeCommand {
    /// Unix socket the management API and ADS listen on
    #[arg(long, env = "NETGLUE_LISTEN_SOCK", default_value = agent::DEFAULT_LISTEN_SOCK)]
    listen_sock: PathBuf,
    /// Node uplink receiving published host ports
    #[arg(long, env = "NETGLUE_HOST_IFACE", value_name = "IFACE")]
    host_iface: String,
    /// Cgroup the getsockopt program is attached to
    #[arg(long, env = "NETGLUE_CGROUP", default_value = agent::DEFAULT_CGROUP)]
    cgroup: PathBuf,
    /// Directory holding snat.o, dnat.o, arp.o and tproxy.o
    #[arg(long, env = "NETGLUE_BPF_OBJECTS_DIR", default_value = DEFAULT_OBJECTS_DIR)]
    bpf_objects_dir: PathBuf,
    /// Resolver the proxy forwards DNS queries to
    #[arg(long, env = "NETGLUE_DNS_UPSTREAM", value_name = "ADDR")]
    dns_upstream: Option<SocketAddr>,
    /// Address the proxy's DNS listeners bind
    #[arg(long, env = "NETGLUE_DNS_LISTEN", value_name = "ADDR")]
    dns_listen: Option<SocketAddr>,
    /// Node id the proxy identifies itself with over ADS
    #[arg(long, env = "NETGLUE_NODE_ID", default_value = DEFAULT_NODE_ID)]
    node_id: String,
}

#[tokio::main]
async fn main() {
    netglue::init_tracing();
    if let Err(err) = run().await {
        eprintln!("netglued error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Node(cmd)) => {
            let defaults = ProxyConfig::default();
            let opts = AgentOptions {
                listen_sock: cmd.listen_sock,
                host_iface: cmd.host_iface,
                cgroup: cmd.cgroup,
                objects_dir: cmd.bpf_objects_dir,
                node_id: cmd.node_id,
                proxy: ProxyConfig {
                    dns_listen: cmd.dns_listen.unwrap_or(defaults.dns_listen),
                    dns_upstream: cmd.dns_upstream.unwrap_or(defaults.dns_upstream),
                },
            };
            agent::run(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}
