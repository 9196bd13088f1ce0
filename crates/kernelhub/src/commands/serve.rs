use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use tracing::info;

use super::Command;
use kernelhub_core::GatewayConfig;
use kernelhub_server::ServiceHost;

pub struct ServeCommand {
    pub config: GatewayConfig,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

impl ServeCommand {
    fn effective_config(&self) -> GatewayConfig {
        let mut config = self.config.clone();
        if let Some(bind) = &self.bind {
            config.server.bind.clone_from(bind);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config
    }
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let config = self.effective_config();
        info!(
            kernel = %config.kernel.program,
            max_sessions = config.sessions.max_sessions,
            "Starting kernelhub on {}",
            config.server.address()
        );

        let mut host = ServiceHost::new(&config);
        let addr = host
            .start()
            .await
            .map_err(|e| eyre!("Failed to start server: {}", e))?;

        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "Server listening on {addr}")?;
            writeln!(stdout, "Press Ctrl+C to shutdown")?;
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");

        host.shutdown()
            .await
            .map_err(|e| eyre!("Failed to shutdown server: {}", e))?;
        info!("Server shutdown complete");

        Ok(())
    }
}
