use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Error;

/// Network configuration handed to the plugin on stdin.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Unix socket of the node agent's management API.
    #[serde(default)]
    pub platformd_listen_sock: String,
    #[serde(default)]
    pub ipam: Option<IpamConf>,
    /// Directory holding the datapath objects; the agent default when unset.
    #[serde(default)]
    pub bpf_objects_dir: Option<PathBuf>,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
}

/// IPAM block. Everything but the plugin type is passed through untouched.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub container_port: u16,
    #[serde(default)]
    pub protocol: String,
}

impl NetConf {
    pub fn parse(stdin: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(stdin).map_err(Error::Config)
    }

    /// IPAM plugin name, if an IPAM block with a type is configured.
    pub fn ipam_plugin(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.plugin_type.as_str())
            .filter(|plugin| !plugin.is_empty())
    }

    /// First published host port; zero counts as unset.
    pub fn host_port(&self) -> Option<u16> {
        self.runtime_config
            .port_mappings
            .first()
            .map(|mapping| mapping.host_port)
            .filter(|port| *port != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = r#"{
        "cniVersion": "1.0.0",
        "name": "netglue",
        "type": "netglue",
        "platformdListenSock": "/run/netglue/netglued.sock",
        "ipam": {
            "type": "host-local",
            "ranges": [[{"subnet": "10.0.0.0/24"}]]
        },
        "runtimeConfig": {
            "portMappings": [
                {"hostPort": 25565, "containerPort": 25565, "protocol": "tcp"}
            ]
        }
    }"#;

    #[test]
    fn parses_camel_case_config() {
        let conf = NetConf::parse(CONF.as_bytes()).unwrap();
        assert_eq!(conf.cni_version, "1.0.0");
        assert_eq!(conf.platformd_listen_sock, "/run/netglue/netglued.sock");
        assert_eq!(conf.ipam_plugin(), Some("host-local"));
        assert_eq!(conf.host_port(), Some(25565));
        assert!(conf.bpf_objects_dir.is_none());
    }

    #[test]
    fn ipam_fields_are_preserved() {
        let conf = NetConf::parse(CONF.as_bytes()).unwrap();
        let ipam = conf.ipam.unwrap();
        assert!(ipam.rest.contains_key("ranges"));
    }

    #[test]
    fn missing_sections_default() {
        let conf = NetConf::parse(br#"{"cniVersion":"1.0.0"}"#).unwrap();
        assert!(conf.platformd_listen_sock.is_empty());
        assert_eq!(conf.ipam_plugin(), None);
        assert_eq!(conf.host_port(), None);
    }

    #[test]
    fn zero_host_port_is_unset() {
        let conf = NetConf::parse(
            br#"{"runtimeConfig":{"portMappings":[{"hostPort":0,"containerPort":80}]}}"#,
        )
        .unwrap();
        assert_eq!(conf.host_port(), None);
    }

    #[test]
    fn invalid_json_is_config_error() {
        assert!(matches!(NetConf::parse(b"{"), Err(Error::Config(_))));
    }
}
