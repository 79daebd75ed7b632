//! Delegation to an IPAM plugin using the CNI exec protocol.

use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, anyhow, bail};
use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// CNI environment forwarded to delegated plugins.
#[derive(Clone, Debug, Default)]
pub struct ExecEnv {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    /// `CNI_PATH`: colon separated plugin directories.
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct IpamResult {
    #[serde(default)]
    ips: Vec<IpConfig>,
}

#[derive(Debug, Deserialize)]
struct IpConfig {
    address: IpNet,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

/// Runs `ADD` and returns the IPv4 addresses in the order the plugin listed
/// them.
pub async fn exec_add(plugin: &str, stdin: &[u8], env: &ExecEnv) -> Result<Vec<Ipv4Net>> {
    let stdout = exec(plugin, "ADD", stdin, env).await?;
    let result: IpamResult = serde_json::from_slice(&stdout)
        .with_context(|| format!("failed to parse {plugin} result"))?;
    Ok(result
        .ips
        .into_iter()
        .filter_map(|ip| match ip.address {
            IpNet::V4(net) => Some(net),
            IpNet::V6(_) => None,
        })
        .collect())
}

pub async fn exec_del(plugin: &str, stdin: &[u8], env: &ExecEnv) -> Result<()> {
    exec(plugin, "DEL", stdin, env).await.map(|_| ())
}

async fn exec(plugin: &str, command: &str, stdin: &[u8], env: &ExecEnv) -> Result<Vec<u8>> {
    let binary = find_plugin(plugin, &env.path)?;
    debug!(plugin = %binary.display(), command, "delegating to ipam plugin");

    let mut child = Command::new(&binary)
        .env_clear()
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &env.container_id)
        .env("CNI_NETNS", &env.netns)
        .env("CNI_IFNAME", &env.ifname)
        .env("CNI_ARGS", &env.args)
        .env("CNI_PATH", &env.path)
        .env("PATH", env::var_os("PATH").unwrap_or_default())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("failed to execute {}", binary.display()))?;

    if let Some(mut input) = child.stdin.take() {
        input
            .write_all(stdin)
            .await
            .with_context(|| format!("failed to write config to {plugin}"))?;
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {plugin}"))?;

    if !output.status.success() {
        return Err(match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(err) if err.details.is_empty() => {
                anyhow!("{plugin} failed with code {}: {}", err.code, err.msg)
            }
            Ok(err) => anyhow!(
                "{plugin} failed with code {}: {}; {}",
                err.code,
                err.msg,
                err.details
            ),
            Err(_) => anyhow!("{plugin} exited with {}", output.status),
        });
    }
    Ok(output.stdout)
}

fn find_plugin(plugin: &str, search_path: &str) -> Result<PathBuf> {
    if plugin.is_empty() || plugin.contains('/') {
        bail!("invalid plugin name {plugin:?}");
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| anyhow!("failed to find plugin {plugin:?} in path {search_path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    fn install(dir: &Path, name: &str, script: &str) {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn env_for(dir: &Path) -> ExecEnv {
        ExecEnv {
            container_id: "ctr".into(),
            netns: "/var/run/netns/ctr".into(),
            ifname: "eth0".into(),
            args: String::new(),
            path: format!("/nonexistent:{}", dir.display()),
        }
    }

    #[tokio::test]
    async fn add_parses_ipv4_addresses() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "fake-ipam",
            r#"#!/bin/sh
cat > /dev/null
echo '{"cniVersion":"1.0.0","ips":[{"address":"10.0.0.1/24"},{"address":"fd00::1/64"},{"address":"10.0.0.2/24"}]}'
"#,
        );

        let ips = exec_add("fake-ipam", b"{}", &env_for(dir.path()))
            .await
            .unwrap();

        assert_eq!(
            ips,
            vec![
                "10.0.0.1/24".parse::<Ipv4Net>().unwrap(),
                "10.0.0.2/24".parse::<Ipv4Net>().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn plugin_sees_command_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "fake-ipam",
            r#"#!/bin/sh
input=$(cat)
if [ "$CNI_COMMAND" = "DEL" ] && [ "$input" = "config" ]; then
  exit 0
fi
echo '{"code":11,"msg":"unexpected call"}'
exit 1
"#,
        );

        exec_del("fake-ipam", b"config", &env_for(dir.path()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn plugin_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "fake-ipam",
            r#"#!/bin/sh
cat > /dev/null
echo '{"cniVersion":"1.0.0","code":11,"msg":"no addresses left"}'
exit 1
"#,
        );

        let err = exec_add("fake-ipam", b"{}", &env_for(dir.path()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "fake-ipam failed with code 11: no addresses left"
        );
    }

    #[test]
    fn missing_plugin_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_plugin("host-local", &dir.path().display().to_string()).unwrap_err();
        assert!(err.to_string().contains("host-local"));
    }

    #[test]
    fn plugin_names_cannot_be_paths() {
        assert!(find_plugin("../bin/sh", "/usr").is_err());
    }
}
