use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Session, SessionId, SessionInfo};
use crate::error::{GatewayError, Result};
use crate::kernel::KernelLauncher;
use crate::relay::DeadlinePolicy;
use crate::supervisor::KernelSupervisor;

/// Process-wide table of live sessions.
///
/// The table lock only guards the map; kernel I/O always happens with it
/// released.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    launcher: Arc<dyn KernelLauncher>,
    relay_policy: DeadlinePolicy,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn KernelLauncher>,
        relay_policy: DeadlinePolicy,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            launcher,
            relay_policy,
            max_sessions,
        }
    }

    /// Create a session and wait for its kernel to become ready.
    pub async fn create_session(&self) -> Result<SessionId> {
        let id = SessionId::new();
        let supervisor = KernelSupervisor::new(id, Arc::clone(&self.launcher), self.relay_policy);
        let session = Arc::new(Session::new(id, supervisor));

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.max_sessions {
                return Err(GatewayError::TooManySessions {
                    limit: self.max_sessions,
                });
            }
            sessions.insert(id, Arc::clone(&session));
        }
        debug!(session_id = %id, "Session registered");

        if let Err(err) = session.supervisor().start().await {
            self.sessions.write().await.remove(&id);
            return Err(err);
        }

        info!(session_id = %id, "Session created");
        Ok(id)
    }

    pub async fn lookup(&self, id: &SessionId) -> Result<Arc<Session>> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if !session.state().is_terminated() => Ok(Arc::clone(session)),
            _ => Err(GatewayError::SessionNotFound {
                session_id: id.to_string(),
            }),
        }
    }

    /// Interrupt any running execution, terminate the kernel and forget the
    /// session. Returns whether the session was present.
    pub async fn destroy_session(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id);
        let Some(session) = removed else {
            debug!(session_id = %id, "Session already gone");
            return false;
        };

        if session.state().is_executing() {
            if let Err(err) = session.supervisor().interrupt().await {
                warn!(session_id = %id, error = %err, "Failed to interrupt before shutdown");
            }
        }
        session.supervisor().terminate().await;
        info!(session_id = %id, "Session destroyed");
        true
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Destroy every session.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Shutting down all sessions");
        for id in ids {
            self.destroy_session(&id).await;
        }
    }
}
