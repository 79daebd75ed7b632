use std::{net::Ipv4Addr, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use super::{
    CreateListenersRequest, DeleteListenersRequest, proxy_service_client::ProxyServiceClient,
};
use crate::cni::ProxyNotifier;

/// [`ProxyNotifier`] talking to the node agent over its unix socket.
#[derive(Clone)]
pub struct GrpcNotifier {
    client: ProxyServiceClient<Channel>,
}

impl GrpcNotifier {
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self> {
        let socket = socket.as_ref().to_path_buf();
        let display = socket.display().to_string();
        // The authority is ignored; every connection dials the socket.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    let stream = UnixStream::connect(socket).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .with_context(|| format!("failed to connect to {display}"))?;
        Ok(Self {
            client: ProxyServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl ProxyNotifier for GrpcNotifier {
    async fn create_listeners(&self, workload_id: &str, addr: Ipv4Addr) -> Result<()> {
        self.client
            .clone()
            .create_listeners(CreateListenersRequest {
                workload_id: workload_id.to_string(),
                ip: addr.to_string(),
            })
            .await
            .context("CreateListeners")?;
        Ok(())
    }

    async fn delete_listeners(&self, workload_id: &str) -> Result<()> {
        self.client
            .clone()
            .delete_listeners(DeleteListenersRequest {
                workload_id: workload_id.to_string(),
            })
            .await
            .context("DeleteListeners")?;
        Ok(())
    }
}
