use async_trait::async_trait;
use eyre::{Result, WrapErr, bail, eyre};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Command;
use kernelhub_core::kernel::ProcessKernelLauncher;
use kernelhub_core::{
    AcquirePolicy, DeadlinePolicy, ExecutionReport, GatewayConfig, GatewayOptions,
    KernelGateway, OutputEvent, RelayStep,
};

pub struct RunCommand {
    pub config: GatewayConfig,
    pub file: Option<PathBuf>,
    pub timeout: Option<u64>,
    pub json: bool,
}

impl RunCommand {
    fn read_code(&self) -> Result<String> {
        match &self.file {
            Some(path) => std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read {}", path.display())),
            None => {
                let mut code = String::new();
                std::io::stdin().read_to_string(&mut code)?;
                Ok(code)
            }
        }
    }

    fn gateway(&self) -> KernelGateway {
        let mut options = GatewayOptions::from(&self.config);
        if let Some(secs) = self.timeout {
            options.relay_policy = DeadlinePolicy::FixedTotal {
                total: Duration::from_secs(secs),
            };
        }
        KernelGateway::new(
            Arc::new(ProcessKernelLauncher::from_config(&self.config.kernel)),
            options,
        )
    }
}

/// Run `code` in a fresh session, writing its output to `out` as it arrives.
pub async fn run_code<W: Write>(
    gateway: &KernelGateway,
    code: &str,
    json: bool,
    out: &mut W,
) -> Result<ExecutionReport> {
    let session_id = gateway
        .start_session()
        .await
        .map_err(|e| eyre!("Failed to start kernel: {}", e))?;
    debug!(session_id = %session_id, "Running code");

    let result = async {
        let mut running = gateway
            .execute(&session_id, code, AcquirePolicy::Reject)
            .await?;
        let mut events = Vec::new();
        let completion = loop {
            match running.next_step().await {
                RelayStep::Event(event) => {
                    write_event(out, &event, json)?;
                    out.flush()?;
                    events.push(event);
                }
                RelayStep::Finished(completion) => break completion,
            }
        };
        if json {
            writeln!(out, "{}", serde_json::to_string(&completion)?)?;
            out.flush()?;
        }
        Ok(ExecutionReport { events, completion })
    }
    .await;
    gateway.shutdown_session(&session_id).await;
    result
}

fn write_event<W: Write>(out: &mut W, event: &OutputEvent, json: bool) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string(event)?)?;
        return Ok(());
    }
    match event {
        OutputEvent::Stream { text, .. } => write!(out, "{text}")?,
        OutputEvent::Result { text } => writeln!(out, "{text}")?,
        OutputEvent::Error {
            name,
            message,
            trace,
        } => {
            if trace.is_empty() {
                writeln!(out, "{name}: {message}")?;
            }
            for line in trace {
                if line.ends_with('\n') {
                    write!(out, "{line}")?;
                } else {
                    writeln!(out, "{line}")?;
                }
            }
        }
        OutputEvent::StatusIdle | OutputEvent::StatusBusy => {}
    }
    Ok(())
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self) -> Result<()> {
        let code = self.read_code()?;
        let gateway = self.gateway();

        let result = run_code(&gateway, &code, self.json, &mut std::io::stdout()).await;
        gateway.shutdown().await;
        let report = result?;

        if let Some(cause) = report.completion.degraded_cause() {
            bail!("Execution did not finish cleanly: {cause}");
        }
        if report.has_error() {
            bail!("Execution raised an error");
        }
        Ok(())
    }
}
