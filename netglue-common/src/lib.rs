#![cfg_attr(not(test), no_std)]

// Key/value layouts of the datapath maps shared with the eBPF programs.
// Keep this crate `no_std` so the layouts can be reused from eBPF code.

/// Pinned map holding [`NetData`] keyed by host port and by pod address.
pub const MAP_NET_DATA: &str = "net_data_map";
/// Pinned map holding [`SnatTarget`] keyed by slot.
pub const MAP_SNAT_TARGETS: &str = "ptp_snat_config";
/// Pinned map holding [`DnatTarget`] keyed by host port.
pub const MAP_DNAT_TARGETS: &str = "ptp_dnat_targets";
/// Pinned map holding [`VethPairEntry`] keyed by interface index.
pub const MAP_VETH_PAIRS: &str = "veth_pair_map";

/// NAT binding of one veth pair.
///
/// Stored twice in `net_data_map`: once under the 32-bit host port and once
/// under the pod address, so ingress (port addressed) and return traffic
/// (address addressed) resolve to the same target.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct NetData {
    /// Pod address, numeric value of the big-endian octets.
    pub pod_addr: u32,
    pub if_index: u8,
    pub mac: [u8; 6],
    pub pad: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SnatTarget {
    pub addr: u32,
    pub if_index: u8,
    pub pad: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DnatTarget {
    pub addr: u32,
    pub if_index: u8,
    pub mac: [u8; 6],
    pub pad: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct VethPairEntry {
    pub host_if_index: u32,
    pub host_if_addr: u32,
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{DnatTarget, NetData, SnatTarget, VethPairEntry};
    use aya::Pod;

    unsafe impl Pod for NetData {}
    unsafe impl Pod for SnatTarget {}
    unsafe impl Pod for DnatTarget {}
    unsafe impl Pod for VethPairEntry {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layouts_match_datapath_structs() {
        assert_eq!(size_of::<NetData>(), 12);
        assert_eq!(size_of::<SnatTarget>(), 8);
        assert_eq!(size_of::<DnatTarget>(), 12);
        assert_eq!(size_of::<VethPairEntry>(), 8);
    }
}
