//! Sessions, their identifiers and lifecycle states, and the per-session
//! execution lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::supervisor::KernelSupervisor;

mod id;
mod registry;
mod serializer;
mod state;

pub use id::SessionId;
pub use registry::SessionRegistry;
pub use serializer::{AcquirePolicy, ExecutionPermit, acquire};
pub use state::SessionState;

/// One live kernel session.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    supervisor: KernelSupervisor,
    execution_lock: Arc<Mutex<()>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, supervisor: KernelSupervisor) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            supervisor,
            execution_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn supervisor(&self) -> &KernelSupervisor {
        &self.supervisor
    }

    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }

    pub(crate) fn execution_lock(&self) -> &Arc<Mutex<()>> {
        &self.execution_lock
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            state: self.state(),
            created_at: self.created_at,
            kernel_generation: self.supervisor.generation(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub kernel_generation: u64,
}
