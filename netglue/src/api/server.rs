use std::{future::Future, io, net::IpAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use tokio::{fs, net::UnixListener};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status, transport::Server};
use tracing::{info, warn};

use super::{
    CreateListenersRequest, CreateListenersResponse, DeleteListenersRequest,
    DeleteListenersResponse, proxy_service_server,
};
use crate::{proxy::ProxyService, xds::AdsServer};

/// gRPC facade over a [`ProxyService`].
pub struct ProxyServer<S: ?Sized> {
    service: Arc<S>,
}

impl<S: ?Sized> ProxyServer<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl<S> proxy_service_server::ProxyService for ProxyServer<S>
where
    S: ProxyService + ?Sized + 'static,
{
    async fn create_listeners(
        &self,
        request: Request<CreateListenersRequest>,
    ) -> Result<Response<CreateListenersResponse>, Status> {
        let request = request.into_inner();
        if request.workload_id.is_empty() {
            return Err(Status::invalid_argument("workload id is empty"));
        }
        let addr: IpAddr = request
            .ip
            .parse()
            .map_err(|_| Status::invalid_argument(format!("invalid ip {:?}", request.ip)))?;

        self.service
            .create_listeners(&request.workload_id, addr)
            .map_err(internal)?;
        Ok(Response::new(CreateListenersResponse {}))
    }

    async fn delete_listeners(
        &self,
        request: Request<DeleteListenersRequest>,
    ) -> Result<Response<DeleteListenersResponse>, Status> {
        let request = request.into_inner();
        if request.workload_id.is_empty() {
            return Err(Status::invalid_argument("workload id is empty"));
        }

        self.service
            .delete_listeners(&request.workload_id)
            .map_err(internal)?;
        Ok(Response::new(DeleteListenersResponse {}))
    }
}

fn internal(err: crate::proxy::Error) -> Status {
    let err = anyhow::Error::from(err);
    warn!("proxy service call failed: {err:#}");
    Status::internal(format!("{err:#}"))
}

/// Serves the proxy service and ADS on `socket` until `shutdown` resolves.
/// A stale socket file from an earlier run is replaced and removed again on
/// exit.
pub async fn serve<S, F>(
    socket: &Path,
    service: Arc<S>,
    ads: AdsServer,
    shutdown: F,
) -> Result<()>
where
    S: ProxyService + ?Sized + 'static,
    F: Future<Output = ()>,
{
    remove_socket(socket).await?;
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    info!(socket = %socket.display(), "management api listening");

    let result = Server::builder()
        .add_service(proxy_service_server::ProxyServiceServer::new(
            ProxyServer::new(service),
        ))
        .add_service(AggregatedDiscoveryServiceServer::new(ads))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .context("management api failed");

    remove_socket(socket).await?;
    result
}

async fn remove_socket(socket: &Path) -> Result<()> {
    match fs::remove_file(socket).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", socket.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{proxy, xds};
    use proxy_service_server::ProxyService as _;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeService {
        created: Mutex<Vec<(String, IpAddr)>>,
        deleted: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FakeService {
        fn check(&self, workload_id: &str) -> Result<(), proxy::Error> {
            if self.fail {
                return Err(proxy::Error::DeleteListeners {
                    workload_id: workload_id.to_string(),
                    source: xds::Error::SetSnapshot {
                        node_id: "proxy-0".into(),
                        version: 1,
                        source: anyhow::anyhow!("push failed"),
                    },
                });
            }
            Ok(())
        }
    }

    impl ProxyService for FakeService {
        fn apply_global_resources(&self) -> Result<(), proxy::Error> {
            Ok(())
        }

        fn create_listeners(&self, workload_id: &str, addr: IpAddr) -> Result<(), proxy::Error> {
            self.check(workload_id)?;
            self.created
                .lock()
                .unwrap()
                .push((workload_id.to_string(), addr));
            Ok(())
        }

        fn delete_listeners(&self, workload_id: &str) -> Result<(), proxy::Error> {
            self.check(workload_id)?;
            self.deleted.lock().unwrap().push(workload_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_listeners_parses_ip() {
        let service = Arc::new(FakeService::default());
        let server = ProxyServer::new(service.clone());

        server
            .create_listeners(Request::new(CreateListenersRequest {
                workload_id: "abc".into(),
                ip: "10.0.0.1".into(),
            }))
            .await
            .unwrap();

        assert_eq!(
            *service.created.lock().unwrap(),
            vec![("abc".to_string(), "10.0.0.1".parse::<IpAddr>().unwrap())]
        );
    }

    #[tokio::test]
    async fn invalid_ip_is_invalid_argument() {
        let server = ProxyServer::new(Arc::new(FakeService::default()));

        let status = server
            .create_listeners(Request::new(CreateListenersRequest {
                workload_id: "abc".into(),
                ip: "not-an-ip".into(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn service_failure_is_internal() {
        let server = ProxyServer::new(Arc::new(FakeService {
            fail: true,
            ..Default::default()
        }));

        let status = server
            .delete_listeners(Request::new(DeleteListenersRequest {
                workload_id: "abc".into(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("push failed"));
    }

    #[tokio::test]
    async fn notifier_reaches_service_over_socket() {
        use crate::{api::GrpcNotifier, cni::ProxyNotifier};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("netglued.sock");
        let service = Arc::new(FakeService::default());

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn({
            let socket = socket.clone();
            let service = service.clone();
            async move {
                serve(&socket, service, AdsServer::new(xds::NodeSnapshots::new()), async {
                    let _ = stop_rx.await;
                })
                .await
            }
        });

        let mut notifier = None;
        for _ in 0..50 {
            if let Ok(n) = GrpcNotifier::connect(&socket).await {
                notifier = Some(n);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let notifier = notifier.expect("management api did not come up");

        notifier
            .create_listeners("abc", "10.0.0.1".parse().unwrap())
            .await
            .unwrap();
        notifier.delete_listeners("abc").await.unwrap();

        assert_eq!(service.created.lock().unwrap().len(), 1);
        assert_eq!(*service.deleted.lock().unwrap(), vec!["abc".to_string()]);

        drop(notifier);
        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
