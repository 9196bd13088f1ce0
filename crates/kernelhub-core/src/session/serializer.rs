use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{Session, SessionId};
use crate::error::{GatewayError, Result};

/// What to do when another execution already holds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Fail immediately with `SessionBusy`.
    Reject,
    /// Queue behind the current execution for at most this long.
    Wait(Duration),
}

/// Exclusive right to run one execution on a session.
///
/// Dropping the permit returns the session to `Idle` if it is still marked
/// busy, then unlocks it for the next caller.
pub struct ExecutionPermit {
    session: Arc<Session>,
    _guard: OwnedMutexGuard<()>,
}

impl ExecutionPermit {
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.session.supervisor().release();
    }
}

impl std::fmt::Debug for ExecutionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPermit")
            .field("session_id", &self.session.id())
            .finish_non_exhaustive()
    }
}

/// Take the session's execution lock under `policy`.
pub async fn acquire(session: &Arc<Session>, policy: AcquirePolicy) -> Result<ExecutionPermit> {
    let lock = Arc::clone(session.execution_lock());
    let guard = match policy {
        AcquirePolicy::Reject => lock.try_lock_owned().map_err(|_| busy(session))?,
        AcquirePolicy::Wait(bound) => tokio::time::timeout(bound, lock.lock_owned())
            .await
            .map_err(|_| {
                debug!(session_id = %session.id(), ?bound, "Timed out waiting for execution lock");
                busy(session)
            })?,
    };

    if session.state().is_terminated() {
        return Err(GatewayError::SessionNotFound {
            session_id: session.id().to_string(),
        });
    }

    Ok(ExecutionPermit {
        session: Arc::clone(session),
        _guard: guard,
    })
}

fn busy(session: &Session) -> GatewayError {
    GatewayError::SessionBusy {
        session_id: session.id().to_string(),
    }
}
