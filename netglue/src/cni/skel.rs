//! Plumbing between the container runtime and the orchestrator: environment,
//! stdin and the JSON printed back.

use std::{
    env,
    io::{self, Read, Write},
    process::ExitCode,
};

use serde::Serialize;

use super::{CniError, Error};
use crate::ipam::ExecEnv;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl Command {
    fn parse(command: &str) -> Result<Self, Error> {
        match command {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

/// Invocation of the plugin as described by the `CNI_*` variables and stdin.
#[derive(Clone, Debug, Default)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin: Vec<u8>,
}

impl CmdArgs {
    /// Environment handed on to delegated plugins.
    pub fn exec_env(&self) -> ExecEnv {
        ExecEnv {
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            ifname: self.ifname.clone(),
            args: self.args.clone(),
            path: self.path.clone(),
        }
    }
}

/// Reads the command and its arguments from the process environment.
pub fn from_env() -> Result<(Command, CmdArgs), Error> {
    let mut stdin = Vec::new();
    let command = Command::parse(&env::var("CNI_COMMAND").unwrap_or_default())?;
    if command != Command::Version {
        io::stdin().read_to_end(&mut stdin).map_err(Error::ReadConfig)?;
    }
    let args = parse_env(command, |key| env::var(key).ok(), stdin)?;
    Ok((command, args))
}

fn parse_env(
    command: Command,
    lookup: impl Fn(&str) -> Option<String>,
    stdin: Vec<u8>,
) -> Result<CmdArgs, Error> {
    let required = |key: &'static str| -> Result<String, Error> {
        lookup(key)
            .filter(|value| !value.is_empty())
            .ok_or(Error::MissingEnv(key))
    };
    let optional = |key: &str| lookup(key).unwrap_or_default();

    match command {
        Command::Version => Ok(CmdArgs::default()),
        Command::Add | Command::Check => Ok(CmdArgs {
            container_id: required("CNI_CONTAINERID")?,
            netns: required("CNI_NETNS")?,
            ifname: required("CNI_IFNAME")?,
            args: optional("CNI_ARGS"),
            path: required("CNI_PATH")?,
            stdin,
        }),
        // The sandbox may already be gone on DEL.
        Command::Del => Ok(CmdArgs {
            container_id: required("CNI_CONTAINERID")?,
            netns: optional("CNI_NETNS"),
            ifname: required("CNI_IFNAME")?,
            args: optional("CNI_ARGS"),
            path: required("CNI_PATH")?,
            stdin,
        }),
    }
}

/// Prints `value` as the command's JSON output.
pub fn print<T: Serialize>(value: &T) -> ExitCode {
    let mut stdout = io::stdout().lock();
    match serde_json::to_writer(&mut stdout, value) {
        Ok(()) => {
            let _ = writeln!(stdout);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to write result: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Prints the CNI error object for `err` and fails the command.
pub fn fail(cni_version: &str, err: &Error) -> ExitCode {
    print(&CniError::new(cni_version, err));
    ExitCode::FAILURE
}
