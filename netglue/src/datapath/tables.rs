use std::{
    collections::HashMap as StdHashMap,
    hash::Hash,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use aya::{
    Pod,
    maps::{HashMap, Map, MapData, MapError},
};

use netglue_common::{
    DnatTarget, MAP_DNAT_TARGETS, MAP_NET_DATA, MAP_SNAT_TARGETS, MAP_VETH_PAIRS, NetData,
    SnatTarget, VethPairEntry,
};

/// Plain key/value table as exposed by the kernel hash maps.
///
/// There is no generation counting: a second insert with the same key
/// replaces the first one.
pub trait Table<K, V> {
    fn insert(&mut self, key: K, value: V) -> Result<()>;
    fn remove(&mut self, key: &K) -> Result<()>;
    fn get(&self, key: &K) -> Result<Option<V>>;
}

impl<K: Pod, V: Pod> Table<K, V> for HashMap<MapData, K, V> {
    fn insert(&mut self, key: K, value: V) -> Result<()> {
        HashMap::insert(self, key, value, 0).map_err(|e| anyhow!("map insert: {e}"))
    }

    fn remove(&mut self, key: &K) -> Result<()> {
        HashMap::remove(self, key).map_err(|e| anyhow!("map remove: {e}"))
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        match HashMap::get(self, key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(anyhow!("map lookup: {e}")),
        }
    }
}

impl<K: Eq + Hash + Copy, V: Copy> Table<K, V> for StdHashMap<K, V> {
    fn insert(&mut self, key: K, value: V) -> Result<()> {
        StdHashMap::insert(self, key, value);
        Ok(())
    }

    fn remove(&mut self, key: &K) -> Result<()> {
        StdHashMap::remove(self, key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("key not found"))
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(StdHashMap::get(self, key).copied())
    }
}

/// Typed operations over the NAT related datapath maps.
pub struct NatTables<N, S, D, P> {
    net_data: N,
    snat: S,
    dnat: D,
    veth_pairs: P,
}

pub type PinnedNatTables = NatTables<
    HashMap<MapData, u32, NetData>,
    HashMap<MapData, u8, SnatTarget>,
    HashMap<MapData, u16, DnatTarget>,
    HashMap<MapData, u32, VethPairEntry>,
>;

impl PinnedNatTables {
    /// Open the maps pinned by the datapath programs under `pin_dir`.
    pub fn open(pin_dir: &Path) -> Result<Self> {
        Ok(Self {
            net_data: open_pinned(pin_dir, MAP_NET_DATA)?,
            snat: open_pinned(pin_dir, MAP_SNAT_TARGETS)?,
            dnat: open_pinned(pin_dir, MAP_DNAT_TARGETS)?,
            veth_pairs: open_pinned(pin_dir, MAP_VETH_PAIRS)?,
        })
    }
}

fn open_pinned<K: Pod, V: Pod>(pin_dir: &Path, name: &str) -> Result<HashMap<MapData, K, V>> {
    let path: PathBuf = pin_dir.join(name);
    let map_data = MapData::from_pin(&path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {e}", path.display()))?;
    let map = Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {e}"))?;
    HashMap::try_from(map).with_context(|| format!("map {name} is not a hash map"))
}

impl<N, S, D, P> NatTables<N, S, D, P>
where
    N: Table<u32, NetData>,
    S: Table<u8, SnatTarget>,
    D: Table<u16, DnatTarget>,
    P: Table<u32, VethPairEntry>,
{
    pub fn new(net_data: N, snat: S, dnat: D, veth_pairs: P) -> Self {
        Self {
            net_data,
            snat,
            dnat,
            veth_pairs,
        }
    }

    pub fn add_net_data(&mut self, host_port: u16, data: NetData) -> Result<()> {
        self.net_data
            .insert(u32::from(host_port), data)
            .context("add net data by port")?;
        self.net_data
            .insert(data.pod_addr, data)
            .context("add net data by addr")?;
        Ok(())
    }

    pub fn del_net_data(&mut self, host_port: u16, data: NetData) -> Result<()> {
        self.net_data
            .remove(&u32::from(host_port))
            .context("delete net data by port")?;
        self.net_data
            .remove(&data.pod_addr)
            .context("delete net data by addr")?;
        Ok(())
    }

    pub fn net_data(&self, host_port: u16) -> Result<Option<NetData>> {
        self.net_data.get(&u32::from(host_port))
    }

    pub fn add_snat_target(&mut self, slot: u8, addr: Ipv4Addr, if_index: u8) -> Result<()> {
        self.snat.insert(
            slot,
            SnatTarget {
                addr: addr_to_key(addr),
                if_index,
                pad: [0; 3],
            },
        )
    }

    pub fn del_snat_target(&mut self, slot: u8) -> Result<()> {
        self.snat.remove(&slot)
    }

    pub fn add_dnat_target(
        &mut self,
        port: u16,
        addr: Ipv4Addr,
        if_index: u8,
        mac: [u8; 6],
    ) -> Result<()> {
        self.dnat.insert(
            port,
            DnatTarget {
                addr: addr_to_key(addr),
                if_index,
                mac,
                pad: 0,
            },
        )
    }

    pub fn del_dnat_target(&mut self, port: u16) -> Result<()> {
        self.dnat.remove(&port)
    }

    pub fn dnat_target(&self, port: u16) -> Result<Option<DnatTarget>> {
        self.dnat.get(&port)
    }

    /// Registers both peers of a veth pair so either index resolves to the
    /// host side.
    pub fn add_veth_pair(
        &mut self,
        host_if_index: u32,
        pod_if_index: u32,
        host_addr: Ipv4Addr,
    ) -> Result<()> {
        let entry = VethPairEntry {
            host_if_index,
            host_if_addr: addr_to_key(host_addr),
        };
        self.veth_pairs
            .insert(host_if_index, entry)
            .context("host")?;
        self.veth_pairs.insert(pod_if_index, entry).context("ctr")?;
        Ok(())
    }

    pub fn del_veth_pair(&mut self, host_if_index: u32, pod_if_index: u32) -> Result<()> {
        self.veth_pairs.remove(&host_if_index).context("host")?;
        self.veth_pairs.remove(&pod_if_index).context("ctr")?;
        Ok(())
    }
}

/// Network byte order is big endian; the maps store the numeric value of the
/// octets read that way.
pub fn addr_to_key(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

pub fn key_to_addr(key: u32) -> Ipv4Addr {
    Ipv4Addr::from(key.to_be_bytes())
}

#[cfg(test)]
pub(crate) type MemoryNatTables = NatTables<
    StdHashMap<u32, NetData>,
    StdHashMap<u8, SnatTarget>,
    StdHashMap<u16, DnatTarget>,
    StdHashMap<u32, VethPairEntry>,
>;

#[cfg(test)]
impl MemoryNatTables {
    pub(crate) fn in_memory() -> Self {
        Self::new(
            StdHashMap::new(),
            StdHashMap::new(),
            StdHashMap::new(),
            StdHashMap::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_data(addr: Ipv4Addr) -> NetData {
        NetData {
            pod_addr: addr_to_key(addr),
            if_index: 2,
            mac: [1, 2, 3, 4, 5, 6],
            pad: 0,
        }
    }

    #[test]
    fn addr_key_uses_big_endian_value() {
        assert_eq!(addr_to_key(Ipv4Addr::new(10, 0, 0, 1)), 167772161);
        assert_eq!(key_to_addr(167772161), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn net_data_is_keyed_by_port_and_addr() {
        let mut tables = MemoryNatTables::in_memory();
        let data = net_data(Ipv4Addr::new(198, 51, 100, 1));

        tables.add_net_data(1337, data).unwrap();

        assert_eq!(Table::get(&tables.net_data, &1337).unwrap(), Some(data));
        assert_eq!(Table::get(&tables.net_data, &data.pod_addr).unwrap(), Some(data));
        assert_eq!(tables.net_data(1337).unwrap(), Some(data));
    }

    #[test]
    fn del_net_data_removes_both_keys() {
        let mut tables = MemoryNatTables::in_memory();
        let data = net_data(Ipv4Addr::new(198, 51, 100, 2));

        tables.add_net_data(420, data).unwrap();
        tables.del_net_data(420, data).unwrap();

        assert_eq!(Table::get(&tables.net_data, &420).unwrap(), None);
        assert_eq!(Table::get(&tables.net_data, &data.pod_addr).unwrap(), None);
    }

    #[test]
    fn snat_target_encodes_address() {
        let mut tables = MemoryNatTables::in_memory();
        tables
            .add_snat_target(0, Ipv4Addr::new(10, 0, 0, 1), 3)
            .unwrap();

        let expected = SnatTarget {
            addr: 167772161,
            if_index: 3,
            pad: [0; 3],
        };
        assert_eq!(Table::get(&tables.snat, &0).unwrap(), Some(expected));

        tables.del_snat_target(0).unwrap();
        assert_eq!(Table::get(&tables.snat, &0).unwrap(), None);
    }

    #[test]
    fn dnat_target_encodes_address_and_mac() {
        let mut tables = MemoryNatTables::in_memory();
        let mac = [0x7e, 0x90, 0xc4, 0xed, 0xdf, 0xd0];
        tables
            .add_dnat_target(0, Ipv4Addr::new(10, 0, 0, 1), 3, mac)
            .unwrap();

        let expected = DnatTarget {
            addr: 167772161,
            if_index: 3,
            mac,
            pad: 0,
        };
        assert_eq!(tables.dnat_target(0).unwrap(), Some(expected));
    }

    #[test]
    fn veth_pair_registers_both_peers() {
        let mut tables = MemoryNatTables::in_memory();
        tables
            .add_veth_pair(7, 8, Ipv4Addr::new(10, 10, 0, 1))
            .unwrap();

        let host = Table::get(&tables.veth_pairs, &7).unwrap().unwrap();
        let ctr = Table::get(&tables.veth_pairs, &8).unwrap().unwrap();
        assert_eq!(host, ctr);
        assert_eq!(host.host_if_index, 7);
        assert_eq!(key_to_addr(host.host_if_addr), Ipv4Addr::new(10, 10, 0, 1));

        tables.del_veth_pair(7, 8).unwrap();
        assert_eq!(Table::get(&tables.veth_pairs, &7).unwrap(), None);
        assert_eq!(Table::get(&tables.veth_pairs, &8).unwrap(), None);
    }

    #[test]
    fn removing_missing_key_fails() {
        let mut tables = MemoryNatTables::in_memory();
        let err = tables.del_dnat_target(9).unwrap_err();
        assert!(err.to_string().contains("key not found"));
    }
}
