use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use aya::{
    Ebpf, EbpfLoader,
    programs::{
        CgroupAttachMode, CgroupSockopt, SchedClassifier,
        links::{FdLink, LinkOrder},
        tc::{TcAttachOptions, TcAttachType},
    },
};
use tracing::{debug, info};

pub const DEFAULT_OBJECTS_DIR: &str = "/opt/netglue/bpf";
pub const DEFAULT_MAP_PIN_DIR: &str = "/sys/fs/bpf/maps";
pub const DEFAULT_PROG_PIN_DIR: &str = "/sys/fs/bpf/progs";

const OBJ_SNAT: &str = "snat.o";
const OBJ_DNAT: &str = "dnat.o";
const OBJ_ARP: &str = "arp.o";
const OBJ_TPROXY: &str = "tproxy.o";

const PROG_SNAT: &str = "snat";
const PROG_DNAT: &str = "dnat";
const PROG_ARP: &str = "arp";
const PROG_HOST_PEER_EGRESS: &str = "host_peer_egress";
const PROG_CTR_PEER_EGRESS: &str = "ctr_peer_egress";
const PROG_GETSOCKOPT: &str = "getsockopt";

/// Where the datapath objects live and where their maps and links are pinned.
#[derive(Clone, Debug)]
pub struct DatapathConfig {
    pub objects_dir: PathBuf,
    pub map_pin_dir: PathBuf,
    pub prog_pin_dir: PathBuf,
}

impl DatapathConfig {
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            map_pin_dir: PathBuf::from(DEFAULT_MAP_PIN_DIR),
            prog_pin_dir: PathBuf::from(DEFAULT_PROG_PIN_DIR),
        }
    }

    fn load(&self, object: &str) -> Result<Ebpf> {
        fs::create_dir_all(&self.map_pin_dir)
            .with_context(|| format!("failed to create {}", self.map_pin_dir.display()))?;
        let path = self.objects_dir.join(object);
        EbpfLoader::new()
            .map_pin_path(&self.map_pin_dir)
            .load_file(&path)
            .with_context(|| format!("failed to load eBPF object {}", path.display()))
    }

    fn link_pin_path(&self, prefix: &str, program: &str) -> PathBuf {
        self.prog_pin_dir.join(format!("{prefix}_{program}"))
    }
}

/// Programs held by the node agent for its whole lifetime.
///
/// Loading every object once also pins the shared maps, which the
/// short-lived CNI invocations then reopen by name.
pub struct Datapath {
    config: DatapathConfig,
    dnat: Ebpf,
    tproxy: Ebpf,
    // Unattached on the node, held so their maps stay pinned.
    _peer_objects: [Ebpf; 2],
}

impl Datapath {
    pub fn load(config: DatapathConfig) -> Result<Self> {
        let snat = config.load(OBJ_SNAT)?;
        let dnat = config.load(OBJ_DNAT)?;
        let arp = config.load(OBJ_ARP)?;
        let tproxy = config.load(OBJ_TPROXY)?;
        info!(objects = %config.objects_dir.display(), "datapath loaded");
        Ok(Self {
            config,
            dnat,
            tproxy,
            _peer_objects: [snat, arp],
        })
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// Attaches the dnat program to the ingress of the node's uplink.
    pub fn attach_node_iface(&mut self, iface: &str) -> Result<()> {
        let program = classifier(&mut self.dnat, PROG_DNAT)?;
        program
            .attach_with_options(iface, TcAttachType::Ingress, tcx())
            .with_context(|| format!("failed to attach {PROG_DNAT} on {iface}"))?;
        info!(iface, "dnat attached");
        Ok(())
    }

    pub fn attach_getsockopt(&mut self, cgroup: &Path) -> Result<()> {
        let file = fs::File::open(cgroup)
            .with_context(|| format!("failed to open cgroup {}", cgroup.display()))?;
        let program: &mut CgroupSockopt = self
            .tproxy
            .program_mut(PROG_GETSOCKOPT)
            .with_context(|| format!("program {PROG_GETSOCKOPT} not found"))?
            .try_into()
            .context("getsockopt program has wrong type")?;
        program
            .load()
            .context("failed to load getsockopt program")?;
        program
            .attach(file, CgroupAttachMode::Single)
            .with_context(|| format!("failed to attach getsockopt to {}", cgroup.display()))?;
        info!(cgroup = %cgroup.display(), "getsockopt attached");
        Ok(())
    }
}

/// Attaches the host side programs of a veth pair and pins the links under
/// `<prog_pin_dir>/<iface>_<program>` so they outlive the CNI process.
pub fn attach_host_peer(config: &DatapathConfig, iface: &str) -> Result<()> {
    let mut snat = config.load(OBJ_SNAT)?;
    attach_and_pin(config, &mut snat, PROG_SNAT, iface, iface, TcAttachType::Ingress)?;

    let mut arp = config.load(OBJ_ARP)?;
    attach_and_pin(config, &mut arp, PROG_ARP, iface, iface, TcAttachType::Ingress)?;

    let mut tproxy = config.load(OBJ_TPROXY)?;
    attach_and_pin(
        config,
        &mut tproxy,
        PROG_HOST_PEER_EGRESS,
        iface,
        iface,
        TcAttachType::Egress,
    )
}

/// Attaches the sandbox side program. Must run inside the sandbox netns;
/// the link is pinned under the host peer's name.
pub fn attach_pod_peer(config: &DatapathConfig, iface: &str, host_iface: &str) -> Result<()> {
    let mut tproxy = config.load(OBJ_TPROXY)?;
    attach_and_pin(
        config,
        &mut tproxy,
        PROG_CTR_PEER_EGRESS,
        iface,
        host_iface,
        TcAttachType::Egress,
    )
}

/// Removes every link pinned for the veth pair whose host peer is `host_iface`.
pub fn unpin_links(config: &DatapathConfig, host_iface: &str) -> Result<()> {
    let prefix = format!("{host_iface}_");
    let entries = match fs::read_dir(&config.prog_pin_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", config.prog_pin_dir.display()));
        }
    };
    for entry in entries {
        let entry = entry.context("failed to read pin entry")?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to unpin {}", entry.path().display()))?;
            debug!(pin = %entry.path().display(), "link unpinned");
        }
    }
    Ok(())
}

fn tcx() -> TcAttachOptions {
    TcAttachOptions::TcxOrder(LinkOrder::default())
}

fn classifier<'a>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut SchedClassifier> {
    let program: &mut SchedClassifier = bpf
        .program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()
        .with_context(|| format!("{name} program has wrong type"))?;
    program
        .load()
        .with_context(|| format!("failed to load {name} program"))?;
    Ok(program)
}

fn attach_and_pin(
    config: &DatapathConfig,
    bpf: &mut Ebpf,
    name: &str,
    iface: &str,
    pin_prefix: &str,
    attach_type: TcAttachType,
) -> Result<()> {
    fs::create_dir_all(&config.prog_pin_dir)
        .with_context(|| format!("failed to create {}", config.prog_pin_dir.display()))?;

    let program = classifier(bpf, name)?;
    let link_id = program
        .attach_with_options(iface, attach_type, tcx())
        .with_context(|| format!("failed to attach {name} on {iface}"))?;
    let link = program
        .take_link(link_id)
        .with_context(|| format!("failed to take {name} link"))?;
    let link = FdLink::try_from(link).map_err(|e| anyhow!("{name} link is not fd based: {e}"))?;

    let pin = config.link_pin_path(pin_prefix, name);
    link.pin(&pin)
        .map_err(|e| anyhow!("failed to pin {name} link at {}: {e}", pin.display()))?;
    debug!(iface, program = name, pin = %pin.display(), "program attached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_pinned_under_host_peer_prefix() {
        let config = DatapathConfig::new("/opt/netglue/bpf");
        assert_eq!(
            config.link_pin_path("abc", PROG_CTR_PEER_EGRESS),
            PathBuf::from("/sys/fs/bpf/progs/abc_ctr_peer_egress")
        );
    }

    #[test]
    fn unpin_removes_only_matching_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DatapathConfig::new("/opt/netglue/bpf");
        config.prog_pin_dir = dir.path().to_path_buf();

        for name in ["abc_snat", "abc_arp", "abd_snat"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        unpin_links(&config, "abc").unwrap();

        assert!(!dir.path().join("abc_snat").exists());
        assert!(!dir.path().join("abc_arp").exists());
        assert!(dir.path().join("abd_snat").exists());
    }

    #[test]
    fn unpin_without_pin_dir_is_noop() {
        let mut config = DatapathConfig::new("/opt/netglue/bpf");
        config.prog_pin_dir = PathBuf::from("/nonexistent/netglue/progs");
        unpin_links(&config, "abc").unwrap();
    }
}
