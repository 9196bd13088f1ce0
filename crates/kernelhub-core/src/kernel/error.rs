use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to spawn kernel process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel did not become ready within {timeout_ms}ms (stderr: {stderr_tail})")]
    StartupTimeout { timeout_ms: u64, stderr_tail: String },

    #[error("kernel exited before becoming ready (stderr: {stderr_tail})")]
    ExitedDuringStartup { stderr_tail: String },

    #[error("kernel control channel failed: {0}")]
    Control(String),

    #[error("failed to encode kernel request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("kernel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupting kernels is not supported on this platform")]
    InterruptUnsupported,

    #[error("kernel is not running")]
    NotRunning,
}
