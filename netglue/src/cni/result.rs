use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;

use super::Error;
use crate::link::VethPair;

pub const DEFAULT_CNI_VERSION: &str = "1.0.0";
pub const SUPPORTED_VERSIONS: [&str; 4] = ["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Result printed on a successful `ADD`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpConfig>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Interface {
    pub name: String,
    pub mac: String,
    pub sandbox: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct IpConfig {
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub interface: usize,
}

impl CniResult {
    pub fn new(cni_version: &str, veth: &VethPair, netns: &str) -> Self {
        Self {
            cni_version: version_or_default(cni_version),
            interfaces: vec![Interface {
                name: veth.pod.name.clone(),
                mac: format_mac(&veth.pod.mac),
                sandbox: netns.to_string(),
            }],
            ips: vec![IpConfig {
                address: veth.pod.addr,
                gateway: veth.host.addr.addr(),
                interface: 0,
            }],
        }
    }
}

/// Error object printed on a failed command.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn new(cni_version: &str, err: &Error) -> Self {
        let mut details = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            details.push(cause.to_string());
            source = cause.source();
        }
        Self {
            cni_version: version_or_default(cni_version),
            code: err.code(),
            msg: err.to_string(),
            details: details.join(": "),
        }
    }
}

/// Formats `err` followed by its causes, `: ` separated.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: version_or_default(cni_version),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

fn version_or_default(version: &str) -> String {
    if version.is_empty() {
        DEFAULT_CNI_VERSION.to_string()
    } else {
        version.to_string()
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{HOST_VETH_MAC, VethPeer};
    use serde_json::json;

    fn veth() -> VethPair {
        VethPair {
            host: VethPeer {
                name: "host0".into(),
                index: 7,
                mac: HOST_VETH_MAC,
                addr: "10.0.0.1/24".parse().unwrap(),
            },
            pod: VethPeer {
                name: "pod0".into(),
                index: 2,
                mac: [0x02, 0, 0, 0, 0, 0x0a],
                addr: "10.0.0.2/24".parse().unwrap(),
            },
        }
    }

    #[test]
    fn result_describes_pod_peer() {
        let result = CniResult::new("0.4.0", &veth(), "/var/run/netns/abc");
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "cniVersion": "0.4.0",
                "interfaces": [{
                    "name": "pod0",
                    "mac": "02:00:00:00:00:0a",
                    "sandbox": "/var/run/netns/abc",
                }],
                "ips": [{
                    "address": "10.0.0.2/24",
                    "gateway": "10.0.0.1",
                    "interface": 0,
                }],
            })
        );
    }

    #[test]
    fn error_carries_code_and_cause() {
        let err = Error::LinkSetup(anyhow::anyhow!("netlink said no"));
        let value = serde_json::to_value(CniError::new("", &err)).unwrap();
        assert_eq!(value["cniVersion"], DEFAULT_CNI_VERSION);
        assert_eq!(value["code"], 100);
        assert_eq!(value["msg"], "failed to set up veth pair");
        assert_eq!(value["details"], "netlink said no");
    }

    #[test]
    fn config_errors_use_code_4() {
        let value = serde_json::to_value(CniError::new("1.0.0", &Error::ListenSockNotSet)).unwrap();
        assert_eq!(value["code"], 4);
        assert!(value.get("details").is_none());
    }

    #[test]
    fn version_info_lists_supported_versions() {
        let info = VersionInfo::new("1.0.0");
        assert_eq!(info.supported_versions, SUPPORTED_VERSIONS);
    }
}
