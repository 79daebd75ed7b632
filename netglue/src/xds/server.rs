use std::{collections::BTreeMap, pin::Pin};

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    aggregated_discovery_service_server::AggregatedDiscoveryService,
};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::{
    Resource, ResourceType, Snapshot,
    cache::{NodeSnapshots, SnapshotRx},
};

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// State of the world aggregated discovery service over [`NodeSnapshots`].
#[derive(Clone)]
pub struct AdsServer {
    snapshots: NodeSnapshots,
}

impl AdsServer {
    pub fn new(snapshots: NodeSnapshots) -> Self {
        Self { snapshots }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = ResponseStream<DiscoveryResponse>;
    type DeltaAggregatedResourcesStream = ResponseStream<DeltaDiscoveryResponse>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let requests = request.into_inner();
        let snapshots = self.snapshots.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            if let Err(status) = serve_stream(requests, snapshots, &tx).await {
                warn!(%status, "ads stream failed");
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }
}

type ResponseTx = mpsc::Sender<Result<DiscoveryResponse, Status>>;

async fn serve_stream(
    mut requests: Streaming<DiscoveryRequest>,
    snapshots: NodeSnapshots,
    tx: &ResponseTx,
) -> Result<(), Status> {
    let mut stream = StreamState::default();
    let mut updates: Option<SnapshotRx> = None;

    loop {
        tokio::select! {
            request = requests.message() => {
                let Some(request) = request? else {
                    debug!(node_id = ?stream.node_id, "ads stream closed");
                    return Ok(());
                };
                if updates.is_none() {
                    let node_id = request
                        .node
                        .as_ref()
                        .map(|node| node.id.clone())
                        .filter(|id| !id.is_empty())
                        .ok_or_else(|| Status::invalid_argument("first request carries no node id"))?;
                    info!(%node_id, "ads stream opened");
                    updates = Some(snapshots.subscribe(&node_id));
                    stream.node_id = Some(node_id);
                }
                let latest = updates.as_ref().and_then(|rx| rx.borrow().clone());
                if let Some(response) = stream.on_request(&request, latest.as_deref()) {
                    send(tx, response).await?;
                }
            }
            changed = changed(&mut updates) => {
                if !changed {
                    return Ok(());
                }
                let latest = updates.as_mut().and_then(|rx| rx.borrow_and_update().clone());
                if let Some(snapshot) = latest {
                    for response in stream.on_snapshot(&snapshot) {
                        send(tx, response).await?;
                    }
                }
            }
        }
    }
}

async fn changed(updates: &mut Option<SnapshotRx>) -> bool {
    match updates {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn send(tx: &ResponseTx, response: DiscoveryResponse) -> Result<(), Status> {
    tx.send(Ok(response))
        .await
        .map_err(|_| Status::cancelled("ads client went away"))
}

/// Per stream bookkeeping: which types the proxy subscribed to and which
/// version each was last sent at.
#[derive(Default)]
struct StreamState {
    node_id: Option<String>,
    sent: BTreeMap<ResourceType, String>,
    nonce: u64,
}

impl StreamState {
    fn on_request(
        &mut self,
        request: &DiscoveryRequest,
        latest: Option<&Snapshot>,
    ) -> Option<DiscoveryResponse> {
        let Some(ty) = ResourceType::from_type_url(&request.type_url) else {
            warn!(type_url = %request.type_url, "unsupported resource type requested");
            return None;
        };

        if let Some(detail) = &request.error_detail {
            warn!(
                node_id = ?self.node_id,
                type_url = %request.type_url,
                version = %request.version_info,
                error = %detail.message,
                "proxy rejected update"
            );
            return None;
        }

        if !request.response_nonce.is_empty()
            && self.sent.get(&ty) == Some(&request.version_info)
        {
            debug!(type_url = %request.type_url, version = %request.version_info, "ack");
            return None;
        }

        // Subscribed but nothing to send yet; the next snapshot answers.
        self.sent.entry(ty).or_default();
        let snapshot = latest?;
        Some(self.respond(snapshot, ty))
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let version = snapshot.version_info();
        let stale: Vec<ResourceType> = self
            .sent
            .iter()
            .filter(|(_, sent)| **sent != version)
            .map(|(ty, _)| *ty)
            .collect();
        stale
            .into_iter()
            .map(|ty| self.respond(snapshot, ty))
            .collect()
    }

    fn respond(&mut self, snapshot: &Snapshot, ty: ResourceType) -> DiscoveryResponse {
        self.nonce += 1;
        let version_info = snapshot.version_info();
        self.sent.insert(ty, version_info.clone());
        DiscoveryResponse {
            version_info,
            resources: snapshot.resources(ty).iter().map(Resource::to_any).collect(),
            type_url: ty.type_url().to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        }
    }
}
