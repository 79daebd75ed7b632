//! CNI plugin entry point. Reads the invocation from the environment and
//! stdin and prints the CNI result or error object.

use std::process::ExitCode;

use anyhow::Context;
use netglue::{
    api::GrpcNotifier,
    cni::{self, Cni, CmdArgs, Command, NetConf, NodeHandler, VersionInfo, skel},
    datapath::{DEFAULT_OBJECTS_DIR, DatapathConfig},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    netglue::init_tracing();

    let (command, args) = match skel::from_env() {
        Ok(invocation) => invocation,
        Err(err) => return skel::fail("", &err),
    };
    if command == Command::Version {
        return skel::print(&VersionInfo::new(""));
    }
    let conf = match NetConf::parse(&args.stdin) {
        Ok(conf) => conf,
        Err(err) => return skel::fail("", &err),
    };

    match command {
        Command::Add => match add(&args, &conf).await {
            Ok(result) => skel::print(&result),
            Err(err) => skel::fail(&conf.cni_version, &err),
        },
        Command::Del => {
            // Failures are logged; the runtime retries DEL forever otherwise.
            del(&args, &conf).await;
            ExitCode::SUCCESS
        }
        Command::Check | Command::Version => ExitCode::SUCCESS,
    }
}

async fn plugin(
    args: &CmdArgs,
    conf: &NetConf,
) -> Result<Cni<NodeHandler, GrpcNotifier>, cni::Error> {
    let objects_dir = conf
        .bpf_objects_dir
        .clone()
        .unwrap_or_else(|| DEFAULT_OBJECTS_DIR.into());
    let handler = NodeHandler::new(DatapathConfig::new(objects_dir), args.exec_env())
        .map_err(cni::Error::Setup)?;
    let notifier = GrpcNotifier::connect(&conf.platformd_listen_sock)
        .await
        .context("node agent unreachable")
        .map_err(cni::Error::Setup)?;
    Ok(Cni::new(handler, notifier))
}

async fn add(args: &CmdArgs, conf: &NetConf) -> Result<cni::CniResult, cni::Error> {
    cni::check_preconditions(args, conf)?;
    plugin(args, conf).await?.attach(args, conf).await
}

async fn del(args: &CmdArgs, conf: &NetConf) {
    match plugin(args, conf).await {
        Ok(mut cni) => {
            cni.detach(args, conf).await;
        }
        Err(err) => {
            tracing::warn!("releasing addresses only: {}", cni::error_chain(&err));
            if let Err(err) = cni::release_addresses(args, conf).await {
                tracing::warn!("detach: {}", cni::error_chain(&err));
            }
        }
    }
}
