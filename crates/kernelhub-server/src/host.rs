use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kernelhub_core::{GatewayConfig, KernelGateway};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{Result, ServerError};
use crate::{AppState, router};

/// Owns the gateway and the HTTP server task serving it.
pub struct ServiceHost {
    gateway: Arc<KernelGateway>,
    bind_addr: String,
    stream_queue_timeout: Duration,
    local_addr: Option<SocketAddr>,
    server_handle: Option<JoinHandle<Result<()>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ServiceHost {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_gateway(
            Arc::new(KernelGateway::from_config(config)),
            config.server.address(),
            config.sessions.stream_queue_timeout(),
        )
    }

    pub fn with_gateway(
        gateway: Arc<KernelGateway>,
        bind_addr: impl Into<String>,
        stream_queue_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            bind_addr: bind_addr.into(),
            stream_queue_timeout,
            local_addr: None,
            server_handle: None,
            shutdown_tx: None,
        }
    }

    pub fn gateway(&self) -> &Arc<KernelGateway> {
        &self.gateway
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.server_handle.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let state = AppState::new(Arc::clone(&self.gateway))
            .with_stream_queue_timeout(self.stream_queue_timeout);
        let app = router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    info!("HTTP server shutdown signal received");
                })
                .await
                .map_err(ServerError::Io)
        });

        self.server_handle = Some(server_handle);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(addr);

        info!("kernelhub listening on {}", addr);
        Ok(addr)
    }

    /// Wait for the server task to exit on its own.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(server_handle) = &mut self.server_handle else {
            return Err(ServerError::NotRunning);
        };
        match server_handle.await {
            Ok(result) => result,
            Err(e) => Err(ServerError::Task(format!("Server task panicked: {e}"))),
        }
    }

    /// Stop accepting connections, then terminate every kernel.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Initiating ServiceHost shutdown");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        self.gateway.shutdown().await;

        if let Some(server_handle) = self.server_handle.take() {
            match server_handle.await {
                Ok(Ok(())) => info!("HTTP server shut down successfully"),
                Ok(Err(e)) => error!("HTTP server error during shutdown: {}", e),
                Err(e) => error!("Failed to join server task: {}", e),
            }
        }

        info!("ServiceHost shutdown complete");
        Ok(())
    }
}
