use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;
use tracing::debug;

use super::{Resource, ResourceType};

/// Immutable merged view of every resource group at one version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub resources: BTreeMap<ResourceType, Vec<Resource>>,
}

impl Snapshot {
    pub fn version_info(&self) -> String {
        self.version.to_string()
    }

    pub fn resources(&self, ty: ResourceType) -> &[Resource] {
        self.resources.get(&ty).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Destination of snapshots, keyed by proxy node id.
pub trait SnapshotCache: Send + Sync {
    fn set_snapshot(&self, node_id: &str, snapshot: Arc<Snapshot>) -> anyhow::Result<()>;
}

impl<T: SnapshotCache + ?Sized> SnapshotCache for Arc<T> {
    fn set_snapshot(&self, node_id: &str, snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        (**self).set_snapshot(node_id, snapshot)
    }
}

type SnapshotTx = watch::Sender<Option<Arc<Snapshot>>>;
pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// Latest snapshot per node, observable through watch channels.
#[derive(Clone, Default)]
pub struct NodeSnapshots {
    nodes: Arc<Mutex<HashMap<String, SnapshotTx>>>,
}

impl NodeSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that yields the current snapshot of `node_id`, if any, and
    /// every later one.
    pub fn subscribe(&self, node_id: &str) -> SnapshotRx {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    #[cfg(test)]
    pub fn latest(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        let nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        nodes.get(node_id).and_then(|tx| tx.borrow().clone())
    }
}

impl SnapshotCache for NodeSnapshots {
    fn set_snapshot(&self, node_id: &str, snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(node_id, version = snapshot.version, "snapshot set");
        nodes
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            version,
            resources: BTreeMap::new(),
        })
    }

    #[test]
    fn snapshot_without_type_has_no_resources() {
        let snap = snapshot(4);
        assert!(snap.resources(ResourceType::Listener).is_empty());
        assert_eq!(snap.version_info(), "4");
    }

    #[test]
    fn latest_snapshot_is_kept_without_subscribers() {
        let cache = NodeSnapshots::new();
        cache.set_snapshot("proxy-0", snapshot(1)).unwrap();
        cache.set_snapshot("proxy-0", snapshot(2)).unwrap();

        assert_eq!(cache.latest("proxy-0").unwrap().version, 2);
        assert!(cache.latest("proxy-1").is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_new_snapshots() {
        let cache = NodeSnapshots::new();
        let mut rx = cache.subscribe("proxy-0");
        assert!(rx.borrow().is_none());

        cache.set_snapshot("proxy-0", snapshot(1)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().version, 1);
    }
}
