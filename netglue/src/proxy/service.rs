use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::info;

use super::{
    DNS_CLUSTER, DNS_PORT, Error, GLOBAL_KEY, ORIGINAL_DST_CLUSTER, ProxyService, dns_cluster,
    dns_resources, original_dst_cluster, workload_resources,
};
use crate::xds::ResourceMap;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Where the DNS listeners bind.
    pub dns_listen: SocketAddr,
    /// Resolver DNS queries are forwarded to.
    pub dns_upstream: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dns_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DNS_PORT),
            dns_upstream: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
        }
    }
}

pub struct Service<M> {
    map: M,
    config: ProxyConfig,
}

impl<M: ResourceMap> Service<M> {
    pub fn new(map: M, config: ProxyConfig) -> Self {
        Self { map, config }
    }
}

impl<M: ResourceMap> ProxyService for Service<M> {
    fn apply_global_resources(&self) -> Result<(), Error> {
        let mut group = dns_resources(
            DNS_CLUSTER,
            self.config.dns_listen,
            self.config.dns_upstream,
        );
        group.clusters = vec![dns_cluster(), original_dst_cluster()];

        let snapshot = self.map.put(GLOBAL_KEY, group).map_err(Error::ApplyGlobal)?;
        info!(version = snapshot.version, "global resources applied");
        Ok(())
    }

    fn create_listeners(&self, workload_id: &str, addr: IpAddr) -> Result<(), Error> {
        let group = workload_resources(workload_id, addr, ORIGINAL_DST_CLUSTER);
        let snapshot = self
            .map
            .put(workload_id, group)
            .map_err(|source| Error::CreateListeners {
                workload_id: workload_id.to_string(),
                source,
            })?;
        info!(workload_id, %addr, version = snapshot.version, "listeners created");
        Ok(())
    }

    fn delete_listeners(&self, workload_id: &str) -> Result<(), Error> {
        let snapshot = self
            .map
            .del(workload_id)
            .map_err(|source| Error::DeleteListeners {
                workload_id: workload_id.to_string(),
                source,
            })?;
        info!(workload_id, version = snapshot.version, "listeners deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::{self, ResourceGroup, Snapshot};
    use anyhow::anyhow;
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    enum Call {
        Put(String, ResourceGroup),
        Del(String),
    }

    /// Records calls; fails every call when `fail` is set.
    #[derive(Default)]
    struct FakeMap {
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl FakeMap {
        fn result(&self) -> Result<Arc<Snapshot>, xds::Error> {
            if self.fail {
                return Err(xds::Error::SetSnapshot {
                    node_id: "proxy-0".into(),
                    version: 1,
                    source: anyhow!("push failed"),
                });
            }
            Ok(Arc::new(Snapshot {
                version: 1,
                resources: BTreeMap::new(),
            }))
        }
    }

    impl ResourceMap for FakeMap {
        fn get(&self, _: &str) -> Option<ResourceGroup> {
            None
        }

        fn put(&self, key: &str, group: ResourceGroup) -> Result<Arc<Snapshot>, xds::Error> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Put(key.to_string(), group));
            self.result()
        }

        fn del(&self, key: &str) -> Result<Arc<Snapshot>, xds::Error> {
            self.calls.lock().unwrap().push(Call::Del(key.to_string()));
            self.result()
        }
    }

    #[test]
    fn global_resources_are_put_under_global_key() {
        let service = Service::new(FakeMap::default(), ProxyConfig::default());
        service.apply_global_resources().unwrap();

        let calls = service.map.calls.lock().unwrap();
        let [Call::Put(key, group)] = calls.as_slice() else {
            panic!("expected one put");
        };
        assert_eq!(key, GLOBAL_KEY);
        let clusters: Vec<&str> = group.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(clusters, [DNS_CLUSTER, ORIGINAL_DST_CLUSTER]);
        let listeners: Vec<&str> = group.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(listeners, ["dns_udp", "dns_tcp"]);
        assert_eq!(group.load_assignments.len(), 2);
    }

    #[test]
    fn create_listeners_puts_workload_group() {
        let service = Service::new(FakeMap::default(), ProxyConfig::default());
        service
            .create_listeners("abc", "127.0.0.1".parse().unwrap())
            .unwrap();

        let calls = service.map.calls.lock().unwrap();
        let [Call::Put(key, group)] = calls.as_slice() else {
            panic!("expected one put");
        };
        assert_eq!(key, "abc");
        let names: Vec<&str> = group.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["tcp-abc", "http-abc"]);
    }

    #[test]
    fn delete_listeners_deletes_workload_key() {
        let service = Service::new(FakeMap::default(), ProxyConfig::default());
        service.delete_listeners("abc").unwrap();

        let calls = service.map.calls.lock().unwrap();
        assert!(matches!(calls.as_slice(), [Call::Del(key)] if key == "abc"));
    }

    #[test]
    fn map_errors_carry_operation_context() {
        let map = FakeMap {
            fail: true,
            ..Default::default()
        };
        let service = Service::new(map, ProxyConfig::default());

        let err = service
            .create_listeners("abc", "127.0.0.1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to create listeners for workload abc");
        assert!(matches!(
            err,
            Error::CreateListeners {
                source: xds::Error::SetSnapshot { .. },
                ..
            }
        ));

        let err = service.apply_global_resources().unwrap_err();
        assert!(matches!(err, Error::ApplyGlobal(_)));
    }
}
