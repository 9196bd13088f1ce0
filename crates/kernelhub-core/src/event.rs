//! Normalized output events produced by the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::kernel::KernelMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stream {
        name: String,
        text: String,
    },
    Result {
        text: String,
    },
    Error {
        name: String,
        message: String,
        trace: Vec<String>,
    },
    StatusIdle,
    StatusBusy,
}

impl OutputEvent {
    pub fn is_status(&self) -> bool {
        matches!(self, OutputEvent::StatusIdle | OutputEvent::StatusBusy)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputEvent::Error { .. })
    }
}

#[derive(Deserialize)]
struct StreamContent {
    #[serde(default = "default_stream_name")]
    name: String,
    #[serde(default)]
    text: String,
}

fn default_stream_name() -> String {
    "stdout".to_string()
}

#[derive(Deserialize)]
struct ExecuteResultContent {
    #[serde(default)]
    data: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct ErrorContent {
    #[serde(default)]
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

/// Map a raw kernel message to an [`OutputEvent`].
///
/// Messages that carry nothing a caller needs (`execute_input`, unknown
/// types, statuses other than idle and busy) yield `None`.
pub fn classify(msg: &KernelMessage) -> Option<OutputEvent> {
    match msg.msg_type.as_str() {
        "stream" => {
            let content: StreamContent = serde_json::from_value(msg.content.clone()).ok()?;
            Some(OutputEvent::Stream {
                name: content.name,
                text: content.text,
            })
        }
        "execute_result" => {
            let content: ExecuteResultContent =
                serde_json::from_value(msg.content.clone()).ok()?;
            let text = match content.data.get("text/plain") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(OutputEvent::Result { text })
        }
        "error" => {
            let content: ErrorContent = serde_json::from_value(msg.content.clone()).ok()?;
            Some(OutputEvent::Error {
                name: content.ename,
                message: content.evalue,
                trace: content.traceback,
            })
        }
        "status" => match msg.execution_state()? {
            "idle" => Some(OutputEvent::StatusIdle),
            "busy" => Some(OutputEvent::StatusBusy),
            _ => None,
        },
        _ => None,
    }
}

/// Why an execution ended without a terminal idle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DegradedCause {
    RelayTimeout,
    KernelChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "completion", content = "reason", rename_all = "snake_case")]
pub enum Completion {
    Clean,
    Degraded(DegradedCause),
}

impl Completion {
    pub fn is_clean(&self) -> bool {
        matches!(self, Completion::Clean)
    }

    pub fn degraded_cause(&self) -> Option<DegradedCause> {
        match self {
            Completion::Clean => None,
            Completion::Degraded(cause) => Some(*cause),
        }
    }
}

/// Everything one execution produced, as returned by the aggregating path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub events: Vec<OutputEvent>,
    #[serde(flatten)]
    pub completion: Completion,
}

impl ExecutionReport {
    pub fn has_error(&self) -> bool {
        self.events.iter().any(OutputEvent::is_error)
    }

    /// Events other than status changes.
    pub fn output(&self) -> impl Iterator<Item = &OutputEvent> {
        self.events.iter().filter(|event| !event.is_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn msg(msg_type: &str, content: Value) -> KernelMessage {
        KernelMessage::new(msg_type, Some("req"), content)
    }

    #[rstest]
    #[case::stdout(
        msg("stream", json!({"name": "stdout", "text": "hi\n"})),
        Some(OutputEvent::Stream { name: "stdout".into(), text: "hi\n".into() })
    )]
    #[case::stream_without_name(
        msg("stream", json!({"text": "x"})),
        Some(OutputEvent::Stream { name: "stdout".into(), text: "x".into() })
    )]
    #[case::result(
        msg("execute_result", json!({"execution_count": 3, "data": {"text/plain": "42"}})),
        Some(OutputEvent::Result { text: "42".into() })
    )]
    #[case::error(
        msg("error", json!({"ename": "ValueError", "evalue": "bad", "traceback": ["tb"]})),
        Some(OutputEvent::Error { name: "ValueError".into(), message: "bad".into(), trace: vec!["tb".into()] })
    )]
    #[case::idle(KernelMessage::status(Some("req"), "idle"), Some(OutputEvent::StatusIdle))]
    #[case::busy(KernelMessage::status(Some("req"), "busy"), Some(OutputEvent::StatusBusy))]
    #[case::starting(KernelMessage::status(Some("req"), "starting"), None)]
    #[case::execute_input(msg("execute_input", json!({"code": "1"})), None)]
    #[case::unknown(msg("comm_open", json!({})), None)]
    fn classifies_raw_messages(#[case] raw: KernelMessage, #[case] expected: Option<OutputEvent>) {
        assert_eq!(classify(&raw), expected);
    }

    #[test]
    fn completion_serializes_with_reason() {
        let degraded = serde_json::to_value(Completion::Degraded(DegradedCause::RelayTimeout))
            .unwrap();
        assert_eq!(
            degraded,
            json!({"completion": "degraded", "reason": "relay_timeout"})
        );
        let clean = serde_json::to_value(Completion::Clean).unwrap();
        assert_eq!(clean, json!({"completion": "clean"}));
    }

    #[test]
    fn report_flattens_completion() {
        let report = ExecutionReport {
            events: vec![OutputEvent::StatusIdle],
            completion: Completion::Clean,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            json!({"events": [{"type": "status_idle"}], "completion": "clean"})
        );
        assert!(!report.has_error());
        assert_eq!(report.output().count(), 0);
    }
}
