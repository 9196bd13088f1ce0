use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    EVENT_CHANNEL_CAPACITY, KernelControl, KernelError, KernelEvents, KernelLauncher,
    KernelMessage, LaunchedKernel,
};
use crate::config::KernelConfig;

const DRIVER_SOURCE: &str = include_str!("driver.py");
const STDERR_TAIL_LINE_LIMIT: usize = 20;
const STDERR_TAIL_SEPARATOR: &str = " | ";

/// Launches kernels as interpreter child processes running the bundled driver.
///
/// The driver reads one JSON request per line on stdin and writes one
/// [`KernelMessage`] per line on stdout. Interrupts are delivered as SIGINT.
#[derive(Debug, Clone)]
pub struct ProcessKernelLauncher {
    program: String,
    args: Vec<String>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProcessKernelLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        let defaults = KernelConfig::default();
        Self {
            program: program.into(),
            args: Vec::new(),
            startup_timeout: defaults.startup_timeout(),
            shutdown_grace: defaults.shutdown_grace(),
        }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            startup_timeout: config.startup_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ProcessKernelLauncher {
    fn default() -> Self {
        Self::from_config(&KernelConfig::default())
    }
}

#[async_trait]
impl KernelLauncher for ProcessKernelLauncher {
    async fn launch(&self) -> Result<LaunchedKernel, KernelError> {
        let mut child = self.command().spawn().map_err(|source| KernelError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::Control("kernel missing stdout".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::Control("kernel missing stdin".to_string()))?;
        let stderr = child.stderr.take();

        let shutdown = CancellationToken::new();
        let recent_stderr = Arc::new(Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINE_LIMIT,
        )));
        let (event_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(read_stdout(stdout, event_tx, shutdown.clone(), pid));
        match stderr {
            Some(stderr) => {
                tokio::spawn(read_stderr(
                    stderr,
                    Arc::clone(&recent_stderr),
                    shutdown.clone(),
                    pid,
                ));
            }
            None => warn!(kernel_pid = ?pid, "kernel missing stderr"),
        }

        let control = ProcessKernelControl {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pid,
            shutdown,
            recent_stderr,
            shutdown_grace: self.shutdown_grace,
        };

        let ready = tokio::time::timeout(self.startup_timeout, wait_until_ready(&mut events)).await;
        match ready {
            Ok(true) => {
                info!(kernel_pid = ?pid, program = %self.program, "Kernel ready");
                Ok(LaunchedKernel {
                    control: Box::new(control),
                    events,
                })
            }
            Ok(false) => {
                let stderr_tail = control.stderr_tail().await;
                control.kill("exited during startup").await;
                Err(KernelError::ExitedDuringStartup { stderr_tail })
            }
            Err(_) => {
                let stderr_tail = control.stderr_tail().await;
                control.kill("startup timeout").await;
                Err(KernelError::StartupTimeout {
                    timeout_ms: u64::try_from(self.startup_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    stderr_tail,
                })
            }
        }
    }
}

/// Consume events until the unparented idle status the driver emits on startup.
async fn wait_until_ready(events: &mut KernelEvents) -> bool {
    while let Some(msg) = events.recv().await {
        if msg.parent_id.is_none() && msg.execution_state() == Some("idle") {
            return true;
        }
        debug!(msg_type = %msg.msg_type, "Discarding kernel message received before ready");
    }
    false
}

async fn read_stdout(
    stdout: ChildStdout,
    events: mpsc::Sender<KernelMessage>,
    shutdown: CancellationToken,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            res = lines.next_line() => match res {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(kernel_pid = ?pid, error = %err, "Failed to read kernel stdout");
                    break;
                }
            },
        };

        let msg: KernelMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(kernel_pid = ?pid, error = %err, line = %line, "Kernel sent invalid JSON");
                continue;
            }
        };

        if events.send(msg).await.is_err() {
            break;
        }
    }
    debug!(kernel_pid = ?pid, "Kernel event stream closed");
}

async fn read_stderr(
    stderr: ChildStderr,
    recent_stderr: Arc<Mutex<VecDeque<String>>>,
    shutdown: CancellationToken,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            res = lines.next_line() => match res {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
        };
        debug!(kernel_pid = ?pid, "kernel stderr: {}", line);

        let mut tail = recent_stderr.lock().await;
        if tail.len() == STDERR_TAIL_LINE_LIMIT {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    msg_id: &'a str,
    code: &'a str,
}

struct ProcessKernelControl {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pid: Option<u32>,
    shutdown: CancellationToken,
    recent_stderr: Arc<Mutex<VecDeque<String>>>,
    shutdown_grace: Duration,
}

impl ProcessKernelControl {
    async fn stderr_tail(&self) -> String {
        let tail = self.recent_stderr.lock().await;
        if tail.is_empty() {
            return "<empty>".to_string();
        }
        tail.iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(STDERR_TAIL_SEPARATOR)
    }

    /// Kill the child and wait briefly for it to exit. Failures are logged only.
    async fn kill(&self, reason: &'static str) {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => {
                self.shutdown.cancel();
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    kernel_pid = ?self.pid,
                    kill_reason = reason,
                    error = %err,
                    "Failed to inspect kernel before kill"
                );
            }
        }

        if let Err(err) = child.start_kill() {
            warn!(
                kernel_pid = ?self.pid,
                kill_reason = reason,
                error = %err,
                "Failed to send kill signal to kernel"
            );
        } else {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(kernel_pid = ?self.pid, kill_reason = reason, %status, "Kernel exited");
                }
                Ok(Err(err)) => {
                    warn!(
                        kernel_pid = ?self.pid,
                        kill_reason = reason,
                        error = %err,
                        "Failed while waiting for kernel exit"
                    );
                }
                Err(_) => {
                    warn!(
                        kernel_pid = ?self.pid,
                        kill_reason = reason,
                        "Timed out waiting for kernel to exit after kill"
                    );
                }
            }
        }

        self.shutdown.cancel();
    }
}

#[async_trait]
impl KernelControl for ProcessKernelControl {
    async fn execute(&self, request_id: &str, code: &str) -> Result<(), KernelError> {
        let mut line = serde_json::to_string(&ExecuteRequest {
            msg_id: request_id,
            code,
        })?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn interrupt(&self) -> Result<(), KernelError> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = self.pid.ok_or(KernelError::NotRunning)?;
        let raw = i32::try_from(pid)
            .map_err(|_| KernelError::Control(format!("kernel pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), Signal::SIGINT)
            .map_err(|e| KernelError::Control(format!("failed to signal kernel: {e}")))?;
        debug!(kernel_pid = pid, "Sent SIGINT to kernel");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn interrupt(&self) -> Result<(), KernelError> {
        Err(KernelError::InterruptUnsupported)
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.kill("shutdown").await;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessKernelControl {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
