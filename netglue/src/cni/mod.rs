//! CNI plugin side: attaches a sandbox to the node datapath and registers its
//! proxy listeners, and tears both down again.

mod args;
mod conf;
mod handler;
mod result;
pub mod skel;

use std::io;

use thiserror::Error;
use tracing::{info, warn};

use crate::ipam;

pub use args::{WORKLOAD_ID_KEY, parse as parse_args, workload_id};
pub use conf::{IpamConf, NetConf, PortMapping, RuntimeConfig};
pub use handler::{AttachedLink, Handler, NodeHandler, ProxyNotifier};
pub use result::{CniError, CniResult, SUPPORTED_VERSIONS, VersionInfo, error_chain};
pub use skel::{CmdArgs, Command};

/// CNI error code for an invalid network configuration.
pub const CODE_INVALID_CONFIG: u32 = 4;
/// CNI error code for invalid environment variables or arguments.
pub const CODE_INVALID_ARGS: u32 = 7;
/// First plugin specific CNI error code.
pub const CODE_PLUGIN: u32 = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown CNI_COMMAND {0:?}")]
    UnknownCommand(String),
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("failed to read network config")]
    ReadConfig(#[source] io::Error),
    #[error("failed to parse network config")]
    Config(#[source] serde_json::Error),
    #[error("invalid CNI_ARGS pair {0:?}")]
    MalformedArgs(String),
    #[error("K8S_POD_UID missing from CNI_ARGS")]
    WorkloadIdMissing,
    #[error("platformdListenSock is not set")]
    ListenSockNotSet,
    #[error("ipam config is not set")]
    IpamConfigNotSet,
    #[error("no host port in runtimeConfig.portMappings")]
    InvalidPort,
    #[error("failed to set up the plugin")]
    Setup(#[source] anyhow::Error),

    #[error("failed to allocate addresses")]
    Ipam(#[source] anyhow::Error),
    #[error("ipam returned {0} addresses, need a host and a pod address")]
    InsufficientAddresses(usize),
    #[error("failed to set up veth pair")]
    LinkSetup(#[source] anyhow::Error),
    #[error("failed to attach host peer programs")]
    HostPrograms(#[source] anyhow::Error),
    #[error("failed to attach sandbox peer programs")]
    SandboxPrograms(#[source] anyhow::Error),
    #[error("failed to add default route")]
    DefaultRoute(#[source] anyhow::Error),
    #[error("failed to add full match route")]
    FullMatchRoute(#[source] anyhow::Error),
    #[error("failed to add redirect target")]
    RedirectTarget(#[source] anyhow::Error),
    #[error("failed to add net data")]
    NetData(#[source] anyhow::Error),
    #[error("failed to create listeners for workload {workload_id}")]
    CreateListeners {
        workload_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to look up link for port {port}")]
    LookupLink {
        port: u16,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to delete full match route")]
    DelFullMatchRoute(#[source] anyhow::Error),
    #[error("failed to delete listeners for workload {workload_id}")]
    DeleteListeners {
        workload_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to delete NAT table entries")]
    DelTableEntries(#[source] anyhow::Error),
    #[error("failed to delete veth pair")]
    DeallocateLink(#[source] anyhow::Error),
    #[error("failed to release addresses")]
    DeallocateAddresses(#[source] anyhow::Error),
}

impl Error {
    /// CNI error code reported for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_)
            | Error::ListenSockNotSet
            | Error::IpamConfigNotSet
            | Error::InvalidPort => CODE_INVALID_CONFIG,
            Error::UnknownCommand(_)
            | Error::MissingEnv(_)
            | Error::MalformedArgs(_)
            | Error::WorkloadIdMissing => CODE_INVALID_ARGS,
            _ => CODE_PLUGIN,
        }
    }
}

/// Validated inputs of one `ADD`.
struct Request<'a> {
    workload_id: String,
    plugin: &'a str,
    host_port: u16,
}

impl<'a> Request<'a> {
    fn validate(args: &CmdArgs, conf: &'a NetConf) -> Result<Self, Error> {
        let workload_id = workload_id(&args.args)?;
        if conf.platformd_listen_sock.is_empty() {
            return Err(Error::ListenSockNotSet);
        }
        let plugin = conf.ipam_plugin().ok_or(Error::IpamConfigNotSet)?;
        let host_port = conf.host_port().ok_or(Error::InvalidPort)?;
        Ok(Self {
            workload_id,
            plugin,
            host_port,
        })
    }
}

/// Checks everything [`Cni::attach`] validates before allocating anything.
pub fn check_preconditions(args: &CmdArgs, conf: &NetConf) -> Result<(), Error> {
    Request::validate(args, conf).map(|_| ())
}

/// Releases the sandbox's addresses straight through the IPAM plugin. Used on
/// DEL when neither the datapath nor the node agent can be reached.
pub async fn release_addresses(args: &CmdArgs, conf: &NetConf) -> Result<(), Error> {
    let Some(plugin) = conf.ipam_plugin() else {
        return Ok(());
    };
    ipam::exec_del(plugin, &args.stdin, &args.exec_env())
        .await
        .map_err(Error::DeallocateAddresses)?;
    info!(container_id = %args.container_id, plugin, "addresses released");
    Ok(())
}

/// Drives a [`Handler`] and a [`ProxyNotifier`] through attach and detach.
pub struct Cni<H, P> {
    handler: H,
    notifier: P,
}

impl<H: Handler, P: ProxyNotifier> Cni<H, P> {
    pub fn new(handler: H, notifier: P) -> Self {
        Self { handler, notifier }
    }

    /// Attaches the sandbox at `args.netns`.
    ///
    /// Addresses are released once if any step fails. Kernel state applied
    /// before the failing step is left in place.
    pub async fn attach(&mut self, args: &CmdArgs, conf: &NetConf) -> Result<CniResult, Error> {
        let request = Request::validate(args, conf)?;

        let result = self.provision(args, conf, &request).await;
        if let Err(err) = &result {
            warn!(workload_id = %request.workload_id, "attach failed: {}", error_chain(err));
            if let Err(dealloc) = self
                .handler
                .deallocate_addresses(request.plugin, &args.stdin)
                .await
            {
                warn!(
                    workload_id = %request.workload_id,
                    "failed to release addresses after attach failure: {dealloc:#}"
                );
            }
        }
        result
    }

    async fn provision(
        &mut self,
        args: &CmdArgs,
        conf: &NetConf,
        request: &Request<'_>,
    ) -> Result<CniResult, Error> {
        let handler = &mut self.handler;
        let port = request.host_port;

        let ips = handler
            .allocate_addresses(request.plugin, &args.stdin)
            .await
            .map_err(Error::Ipam)?;
        let (host_addr, pod_addr) = match ips[..] {
            [host, pod, ..] => (host, pod),
            _ => return Err(Error::InsufficientAddresses(ips.len())),
        };

        let veth = handler
            .allocate_link(&args.netns, host_addr, pod_addr)
            .await
            .map_err(Error::LinkSetup)?;
        handler
            .attach_host_programs(&veth)
            .await
            .map_err(Error::HostPrograms)?;
        handler
            .attach_sandbox_programs(&veth, &args.netns)
            .await
            .map_err(Error::SandboxPrograms)?;
        handler
            .add_default_route(&veth, &args.netns)
            .await
            .map_err(Error::DefaultRoute)?;
        handler
            .add_full_match_route(&veth)
            .await
            .map_err(Error::FullMatchRoute)?;
        handler
            .add_redirect_target(&veth, port)
            .await
            .map_err(Error::RedirectTarget)?;
        handler
            .add_net_data(&veth, port)
            .await
            .map_err(Error::NetData)?;

        self.notifier
            .create_listeners(&request.workload_id, host_addr.addr())
            .await
            .map_err(|source| Error::CreateListeners {
                workload_id: request.workload_id.clone(),
                source,
            })?;

        info!(
            workload_id = %request.workload_id,
            host = %veth.host.name,
            pod = %veth.pod.name,
            pod_addr = %pod_addr,
            port,
            "sandbox attached"
        );
        Ok(CniResult::new(&conf.cni_version, &veth, &args.netns))
    }

    /// Tears down what [`Cni::attach`] set up. Every step after the link
    /// lookup runs even if an earlier one fails; the failures are logged and
    /// returned.
    pub async fn detach(&mut self, args: &CmdArgs, conf: &NetConf) -> Vec<Error> {
        let mut errors = self.teardown(args, conf).await;
        if let Some(plugin) = conf.ipam_plugin() {
            if let Err(err) = self.handler.deallocate_addresses(plugin, &args.stdin).await {
                errors.push(Error::DeallocateAddresses(err));
            }
        }
        for err in &errors {
            warn!(container_id = %args.container_id, "detach: {}", error_chain(err));
        }
        if errors.is_empty() {
            info!(container_id = %args.container_id, "sandbox detached");
        }
        errors
    }

    async fn teardown(&mut self, args: &CmdArgs, conf: &NetConf) -> Vec<Error> {
        let workload_id = match workload_id(&args.args) {
            Ok(id) => id,
            Err(err) => return vec![err],
        };
        let mut errors = Vec::new();
        // Listeners are keyed by workload id alone and go even without a link.
        let link = match conf.host_port() {
            Some(port) => match self.handler.lookup_link(port).await {
                Ok(link) => Some((port, link)),
                Err(source) => {
                    errors.push(Error::LookupLink { port, source });
                    None
                }
            },
            None => {
                errors.push(Error::InvalidPort);
                None
            }
        };

        if let Some((_, link)) = &link {
            if let Err(err) = self.handler.del_full_match_route(link).await {
                errors.push(Error::DelFullMatchRoute(err));
            }
        }
        if let Err(source) = self.notifier.delete_listeners(&workload_id).await {
            errors.push(Error::DeleteListeners {
                workload_id: workload_id.clone(),
                source,
            });
        }
        if let Some((port, link)) = &link {
            if let Err(err) = self.handler.del_table_entries(link, *port).await {
                errors.push(Error::DelTableEntries(err));
            }
            if let Err(err) = self.handler.deallocate_link(link).await {
                errors.push(Error::DeallocateLink(err));
            }
        }
        errors
    }
}
