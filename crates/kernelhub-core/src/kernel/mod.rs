//! Execution kernel backends.
//!
//! A kernel is driven through two channels: a [`KernelControl`] used to submit
//! code, interrupt and shut down, and an event channel carrying raw
//! [`KernelMessage`]s. Message names follow the Jupyter messaging vocabulary
//! (`status`, `stream`, `execute_input`, `execute_result`, `error`), and every
//! message produced while running a request carries that request's id as
//! `parent_id`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

mod error;
pub mod process;

pub use error::KernelError;
pub use process::ProcessKernelLauncher;

/// Capacity of the per-kernel raw event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type KernelEvents = mpsc::Receiver<KernelMessage>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub msg_type: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(msg_type: impl Into<String>, parent_id: Option<&str>, content: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            parent_id: parent_id.map(str::to_string),
            content,
        }
    }

    pub fn status(parent_id: Option<&str>, execution_state: &str) -> Self {
        Self::new(
            "status",
            parent_id,
            serde_json::json!({ "execution_state": execution_state }),
        )
    }

    /// The reported `execution_state` when this is a status message.
    pub fn execution_state(&self) -> Option<&str> {
        if self.msg_type != "status" {
            return None;
        }
        self.content.get("execution_state")?.as_str()
    }

    pub fn is_child_of(&self, request_id: &str) -> bool {
        self.parent_id.as_deref() == Some(request_id)
    }
}

/// A freshly launched kernel that has signalled readiness.
pub struct LaunchedKernel {
    pub control: Box<dyn KernelControl>,
    pub events: KernelEvents,
}

#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel and wait until it is ready to accept code.
    async fn launch(&self) -> Result<LaunchedKernel, KernelError>;
}

#[async_trait]
pub trait KernelControl: Send + Sync {
    /// Queue `code` for execution. Does not wait for the execution to finish.
    async fn execute(&self, request_id: &str, code: &str) -> Result<(), KernelError>;

    /// Ask the kernel to abandon whatever it is running.
    async fn interrupt(&self) -> Result<(), KernelError>;

    /// Stop the kernel and close its event channel.
    async fn shutdown(&self) -> Result<(), KernelError>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_output_line() {
        let line = r#"{"msg_type":"stream","parent_id":"abc","content":{"name":"stdout","text":"hi\n"}}"#;
        let msg: KernelMessage = serde_json::from_str(line).unwrap();
        assert_eq!(msg.msg_type, "stream");
        assert!(msg.is_child_of("abc"));
        assert!(!msg.is_child_of("other"));
        assert_eq!(msg.execution_state(), None);
    }

    #[test]
    fn startup_status_has_no_parent() {
        let msg: KernelMessage =
            serde_json::from_str(r#"{"msg_type":"status","content":{"execution_state":"idle"}}"#)
                .unwrap();
        assert_eq!(msg.parent_id, None);
        assert_eq!(msg.execution_state(), Some("idle"));
    }
}
