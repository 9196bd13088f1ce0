use serde::{Deserialize, Serialize};
use strum::Display;

/// Lifecycle state of a session's kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Starting,
    Idle,
    Busy,
    Interrupting,
    Restarting,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Idle | Terminated)
                | (Idle, Busy | Restarting | Terminated)
                | (Busy, Idle | Interrupting | Restarting | Terminated)
                | (Interrupting, Idle | Restarting | Terminated)
                | (Restarting, Idle | Terminated)
        )
    }

    /// An execution is outstanding.
    pub fn is_executing(self) -> bool {
        matches!(self, SessionState::Busy | SessionState::Interrupting)
    }

    pub fn is_terminated(self) -> bool {
        self == SessionState::Terminated
    }
}
