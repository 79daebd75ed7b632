use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{info, warn};

use super::{Error, Resource, ResourceGroup, ResourceType, Snapshot, SnapshotCache};

/// Keyed store of resource groups. Every mutation publishes a new snapshot.
pub trait ResourceMap: Send + Sync {
    fn get(&self, key: &str) -> Option<ResourceGroup>;
    fn put(&self, key: &str, group: ResourceGroup) -> Result<Arc<Snapshot>, Error>;
    fn del(&self, key: &str) -> Result<Arc<Snapshot>, Error>;
}

#[derive(Default)]
struct State {
    groups: BTreeMap<String, ResourceGroup>,
    version: u64,
}

/// [`ResourceMap`] held in memory and pushed to a [`SnapshotCache`].
///
/// One lock covers store mutation, merge, version bump and push, so
/// snapshots reach the cache in version order and never from a partial
/// merge. A failed push still leaves the store mutated; the next successful
/// mutation of any key carries the change.
pub struct InMemoryMap<C> {
    node_id: String,
    cache: C,
    state: Mutex<State>,
}

impl<C: SnapshotCache> InMemoryMap<C> {
    pub fn new(node_id: impl Into<String>, cache: C) -> Self {
        Self {
            node_id: node_id.into(),
            cache,
            state: Mutex::new(State::default()),
        }
    }

    fn apply(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, ResourceGroup>),
    ) -> Result<Arc<Snapshot>, Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        mutate(&mut state.groups);

        state.version += 1;
        let snapshot = Arc::new(Snapshot {
            version: state.version,
            resources: merge(state.groups.values()),
        });

        if let Err(source) = self.cache.set_snapshot(&self.node_id, snapshot.clone()) {
            warn!(node_id = %self.node_id, version = snapshot.version, "failed to push snapshot");
            return Err(Error::SetSnapshot {
                node_id: self.node_id.clone(),
                version: snapshot.version,
                source,
            });
        }
        info!(node_id = %self.node_id, version = snapshot.version, "snapshot pushed");
        Ok(snapshot)
    }
}

impl<C: SnapshotCache> ResourceMap for InMemoryMap<C> {
    fn get(&self, key: &str) -> Option<ResourceGroup> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.groups.get(key).cloned()
    }

    fn put(&self, key: &str, group: ResourceGroup) -> Result<Arc<Snapshot>, Error> {
        self.apply(|groups| {
            groups.insert(key.to_string(), group);
        })
    }

    fn del(&self, key: &str) -> Result<Arc<Snapshot>, Error> {
        self.apply(|groups| {
            groups.remove(key);
        })
    }
}

fn merge<'a>(
    groups: impl Iterator<Item = &'a ResourceGroup>,
) -> BTreeMap<ResourceType, Vec<Resource>> {
    let mut merged: BTreeMap<ResourceType, Vec<Resource>> = ResourceType::ALL
        .into_iter()
        .map(|ty| (ty, Vec::new()))
        .collect();
    for group in groups {
        for (ty, resources) in group.resources_by_type() {
            merged.entry(ty).or_default().extend(resources);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::NodeSnapshots;
    use anyhow::anyhow;
    use envoy_types::pb::envoy::config::{cluster::v3::Cluster, listener::v3::Listener};
    use std::{collections::HashSet, thread};

    fn cluster(name: &str) -> Cluster {
        Cluster {
            name: name.into(),
            ..Default::default()
        }
    }

    fn listener(name: &str) -> Listener {
        Listener {
            name: name.into(),
            ..Default::default()
        }
    }

    fn names(snapshot: &Snapshot, ty: ResourceType) -> Vec<String> {
        let mut names: Vec<String> = snapshot
            .resources(ty)
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Records every pushed snapshot.
    #[derive(Default)]
    struct RecordingCache {
        pushed: Mutex<Vec<Arc<Snapshot>>>,
    }

    impl SnapshotCache for RecordingCache {
        fn set_snapshot(&self, node_id: &str, snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
            assert_eq!(node_id, "proxy-0");
            self.pushed.lock().unwrap().push(snapshot);
            Ok(())
        }
    }

    struct FailingCache;

    impl SnapshotCache for FailingCache {
        fn set_snapshot(&self, _: &str, _: Arc<Snapshot>) -> anyhow::Result<()> {
            Err(anyhow!("proxy unreachable"))
        }
    }

    #[test]
    fn snapshot_is_union_of_groups() {
        let map = InMemoryMap::new("proxy-0", RecordingCache::default());
        let global = ResourceGroup {
            clusters: vec![cluster("dns"), cluster("original_dst")],
            ..Default::default()
        };
        let workload = ResourceGroup {
            listeners: vec![listener("tcp-workload-1"), listener("http-workload-1")],
            ..Default::default()
        };

        map.put("global", global.clone()).unwrap();
        let snap = map.put("workload-1", workload).unwrap();

        assert_eq!(snap.version, 2);
        assert_eq!(names(&snap, ResourceType::Cluster), ["dns", "original_dst"]);
        assert_eq!(
            names(&snap, ResourceType::Listener),
            ["http-workload-1", "tcp-workload-1"]
        );

        let snap = map.del("workload-1").unwrap();
        assert_eq!(snap.version, 3);
        assert_eq!(snap.resources, merge([global].iter()));
        assert!(map.get("workload-1").is_none());
    }

    #[test]
    fn put_replaces_group_of_key() {
        let map = InMemoryMap::new("proxy-0", RecordingCache::default());
        map.put(
            "abc",
            ResourceGroup {
                listeners: vec![listener("tcp-abc")],
                ..Default::default()
            },
        )
        .unwrap();
        let replacement = ResourceGroup {
            listeners: vec![listener("http-abc")],
            ..Default::default()
        };
        let snap = map.put("abc", replacement.clone()).unwrap();

        assert_eq!(names(&snap, ResourceType::Listener), ["http-abc"]);
        assert_eq!(map.get("abc"), Some(replacement));
    }

    #[test]
    fn concurrent_puts_get_distinct_versions() {
        let map = Arc::new(InMemoryMap::new("proxy-0", Arc::new(RecordingCache::default())));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = map.clone();
                thread::spawn(move || {
                    map.put(
                        &format!("workload-{i}"),
                        ResourceGroup {
                            listeners: vec![listener(&format!("tcp-workload-{i}"))],
                            ..Default::default()
                        },
                    )
                    .unwrap()
                    .version
                })
            })
            .collect();
        let versions: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(versions, (1..=8).collect());
        let pushed = map.cache.pushed.lock().unwrap();
        let pushed_versions: Vec<u64> = pushed.iter().map(|s| s.version).collect();
        assert_eq!(pushed_versions, (1..=8).collect::<Vec<_>>());
        assert_eq!(pushed.last().unwrap().resources(ResourceType::Listener).len(), 8);
    }

    #[test]
    fn failed_push_keeps_store_mutated() {
        let map = InMemoryMap::new("proxy-0", FailingCache);
        let group = ResourceGroup {
            clusters: vec![cluster("dns")],
            ..Default::default()
        };

        let err = map.put("global", group.clone()).unwrap_err();

        assert!(matches!(err, Error::SetSnapshot { version: 1, .. }));
        assert_eq!(map.get("global"), Some(group));
    }

    #[test]
    fn pushes_reach_node_snapshots() {
        let cache = NodeSnapshots::new();
        let map = InMemoryMap::new("proxy-0", cache.clone());
        map.put("global", ResourceGroup::default()).unwrap();
        map.del("global").unwrap();

        assert_eq!(cache.latest("proxy-0").unwrap().version, 2);
    }
}
