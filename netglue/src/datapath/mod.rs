//! Bindings to the kernel packet pipeline: program attachment and the NAT
//! tables shared with the eBPF programs.

mod programs;
mod tables;

pub use programs::{
    DEFAULT_MAP_PIN_DIR, DEFAULT_OBJECTS_DIR, DEFAULT_PROG_PIN_DIR, Datapath, DatapathConfig,
    attach_host_peer, attach_pod_peer, unpin_links,
};
pub use tables::{NatTables, PinnedNatTables, Table, addr_to_key, key_to_addr};

#[cfg(test)]
pub(crate) use tables::MemoryNatTables;
