//! Lifecycle owner for a single session's kernel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::kernel::{KernelControl, KernelEvents, KernelLauncher, LaunchedKernel};
use crate::relay::{DeadlinePolicy, OutputRelay};
use crate::session::{ExecutionPermit, SessionId, SessionState};

struct RunningKernel {
    control: Arc<dyn KernelControl>,
    events: Arc<Mutex<KernelEvents>>,
    generation: u64,
}

/// Owns one kernel, its control handle and its event channel, and drives the
/// session state machine.
///
/// Every state change goes through [`SessionState::can_transition_to`];
/// disallowed transitions fail with `InvalidTransition`.
pub struct KernelSupervisor {
    session_id: SessionId,
    launcher: Arc<dyn KernelLauncher>,
    state: watch::Sender<SessionState>,
    kernel: Mutex<Option<RunningKernel>>,
    generation: AtomicU64,
    relay_policy: DeadlinePolicy,
}

impl KernelSupervisor {
    pub fn new(
        session_id: SessionId,
        launcher: Arc<dyn KernelLauncher>,
        relay_policy: DeadlinePolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            session_id,
            launcher,
            state,
            kernel: Mutex::new(None),
            generation: AtomicU64::new(0),
            relay_policy,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Number of kernels launched for this session so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn relay_policy(&self) -> DeadlinePolicy {
        self.relay_policy
    }

    fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut from = next;
        let changed = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(session_id = %self.session_id, %from, to = %next, "Session state changed");
            Ok(from)
        } else {
            Err(GatewayError::InvalidTransition { from, to: next })
        }
    }

    async fn install(&self, launched: LaunchedKernel) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut kernel = self.kernel.lock().await;
        *kernel = Some(RunningKernel {
            control: Arc::from(launched.control),
            events: Arc::new(Mutex::new(launched.events)),
            generation,
        });
        generation
    }

    async fn control(&self) -> Option<Arc<dyn KernelControl>> {
        let kernel = self.kernel.lock().await;
        kernel.as_ref().map(|k| Arc::clone(&k.control))
    }

    /// Launch the first kernel and move from `Starting` to `Idle`.
    pub async fn start(&self) -> Result<()> {
        let launched = match self.launcher.launch().await {
            Ok(launched) => launched,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "Kernel failed to start");
                let _ = self.transition(SessionState::Terminated);
                return Err(GatewayError::KernelStart(err));
            }
        };

        let generation = self.install(launched).await;
        if let Err(err) = self.transition(SessionState::Idle) {
            // Terminated while the kernel was starting.
            self.shutdown_kernel().await;
            debug!(session_id = %self.session_id, error = %err, "Discarding kernel started for a terminated session");
            return Err(GatewayError::KernelUnavailable {
                session_id: self.session_id.to_string(),
                operation: "start",
                state: self.state(),
            });
        }

        info!(session_id = %self.session_id, generation, "Kernel started");
        Ok(())
    }

    /// Submit `code` for execution and return the relay that drains its output.
    ///
    /// Requires `Idle` and a permit for this session. Does not wait for the
    /// execution to finish.
    pub async fn submit(&self, permit: &ExecutionPermit, code: &str) -> Result<OutputRelay> {
        if permit.session_id() != self.session_id {
            return Err(GatewayError::ForeignPermit {
                session_id: self.session_id.to_string(),
                permit_session: permit.session_id().to_string(),
            });
        }

        if let Err(err) = self.transition(SessionState::Busy) {
            let state = match err {
                GatewayError::InvalidTransition { from, .. } => from,
                _ => self.state(),
            };
            return Err(GatewayError::KernelUnavailable {
                session_id: self.session_id.to_string(),
                operation: "execute",
                state,
            });
        }

        let running = {
            let kernel = self.kernel.lock().await;
            kernel
                .as_ref()
                .map(|k| (Arc::clone(&k.control), Arc::clone(&k.events), k.generation))
        };
        let Some((control, events, generation)) = running else {
            return Err(crate::kernel::KernelError::NotRunning.into());
        };

        let events = events.lock_owned().await;
        let request_id = Uuid::new_v4().to_string();
        control.execute(&request_id, code).await?;

        debug!(
            session_id = %self.session_id,
            request_id = %request_id,
            generation,
            "Submitted code to kernel"
        );
        Ok(OutputRelay::new(
            self.session_id,
            request_id,
            generation,
            events,
            self.relay_policy,
        ))
    }

    /// Ask the kernel to stop the current execution.
    ///
    /// A no-op unless an execution is outstanding. Signalling is best effort:
    /// the kernel may never report idle afterwards.
    pub async fn interrupt(&self) -> Result<()> {
        let mut signal = false;
        self.state.send_if_modified(|current| match *current {
            SessionState::Busy => {
                *current = SessionState::Interrupting;
                signal = true;
                true
            }
            SessionState::Interrupting => {
                signal = true;
                false
            }
            _ => false,
        });

        if !signal {
            debug!(session_id = %self.session_id, state = %self.state(), "Nothing to interrupt");
            return Ok(());
        }

        let Some(control) = self.control().await else {
            return Ok(());
        };
        info!(session_id = %self.session_id, "Interrupting kernel");
        control.interrupt().await?;
        Ok(())
    }

    /// Replace the kernel in place, keeping the session id.
    ///
    /// Closing the old kernel's event channel ends any in-flight relay as
    /// `KernelChannelClosed`. If the new kernel fails to launch the session
    /// is left `Terminated`.
    pub async fn restart(&self) -> Result<u64> {
        if let Err(err) = self.transition(SessionState::Restarting) {
            let state = match err {
                GatewayError::InvalidTransition { from, .. } => from,
                _ => self.state(),
            };
            return Err(GatewayError::KernelUnavailable {
                session_id: self.session_id.to_string(),
                operation: "restart",
                state,
            });
        }

        info!(session_id = %self.session_id, "Restarting kernel");
        self.shutdown_kernel().await;

        let launched = match self.launcher.launch().await {
            Ok(launched) => launched,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "Kernel failed to restart");
                let _ = self.transition(SessionState::Terminated);
                return Err(GatewayError::KernelStart(err));
            }
        };

        let generation = self.install(launched).await;
        if self.transition(SessionState::Idle).is_err() {
            self.shutdown_kernel().await;
            return Err(GatewayError::KernelUnavailable {
                session_id: self.session_id.to_string(),
                operation: "restart",
                state: self.state(),
            });
        }

        info!(session_id = %self.session_id, generation, "Kernel restarted");
        Ok(generation)
    }

    /// Stop the kernel for good. Never fails; kill errors are only logged.
    pub async fn terminate(&self) {
        let mut previous = SessionState::Terminated;
        self.state.send_if_modified(|current| {
            previous = *current;
            if current.is_terminated() {
                false
            } else {
                *current = SessionState::Terminated;
                true
            }
        });
        if !previous.is_terminated() {
            info!(session_id = %self.session_id, from = %previous, "Terminating kernel");
        }
        self.shutdown_kernel().await;
    }

    /// Return to `Idle` after an execution. Other states are left untouched.
    pub fn release(&self) {
        self.state.send_if_modified(|current| {
            if current.is_executing() {
                *current = SessionState::Idle;
                true
            } else {
                false
            }
        });
    }

    async fn shutdown_kernel(&self) {
        let running = self.kernel.lock().await.take();
        let Some(running) = running else {
            return;
        };
        if let Err(err) = running.control.shutdown().await {
            warn!(
                session_id = %self.session_id,
                generation = running.generation,
                error = %err,
                "Failed to shut down kernel"
            );
        }
    }
}

impl std::fmt::Debug for KernelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSupervisor")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Completion, DegradedCause, OutputEvent};
    use crate::session::{AcquirePolicy, Session, acquire};
    use crate::test_utils::FakeKernelLauncher;
    use std::time::Duration;

    fn session_with(launcher: Arc<FakeKernelLauncher>) -> Arc<Session> {
        let id = SessionId::new();
        let supervisor = KernelSupervisor::new(
            id,
            launcher,
            DeadlinePolicy::ResetOnActivity {
                inactivity: Duration::from_millis(300),
            },
        );
        Arc::new(Session::new(id, supervisor))
    }

    #[tokio::test]
    async fn start_moves_to_idle() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        assert_eq!(session.state(), SessionState::Starting);
        session.supervisor().start().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.supervisor().generation(), 1);
    }

    #[tokio::test]
    async fn failed_start_terminates() {
        let launcher = Arc::new(FakeKernelLauncher::new().failing());
        let session = session_with(launcher);
        let err = session.supervisor().start().await.unwrap_err();
        assert!(matches!(err, GatewayError::KernelStart(_)));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn submit_marks_busy_until_permit_dropped() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        session.supervisor().start().await.unwrap();

        let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
        let relay = session.supervisor().submit(&permit, "print(\"hi\")").await.unwrap();
        assert_eq!(session.state(), SessionState::Busy);

        let report = relay.collect().await;
        assert_eq!(report.completion, Completion::Clean);
        drop(permit);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn rejects_foreign_permit() {
        let a = session_with(Arc::new(FakeKernelLauncher::new()));
        let b = session_with(Arc::new(FakeKernelLauncher::new()));
        a.supervisor().start().await.unwrap();
        b.supervisor().start().await.unwrap();

        let permit = acquire(&b, AcquirePolicy::Reject).await.unwrap();
        let err = a.supervisor().submit(&permit, "1").await.unwrap_err();
        assert!(matches!(err, GatewayError::ForeignPermit { .. }));
        assert_eq!(a.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn submit_while_starting_is_unavailable() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
        let err = session.supervisor().submit(&permit, "1").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::KernelUnavailable {
                state: SessionState::Starting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn interrupt_is_noop_when_idle() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let session = session_with(Arc::clone(&launcher));
        session.supervisor().start().await.unwrap();
        session.supervisor().interrupt().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(launcher.stats().interrupts, 0);
    }

    #[tokio::test]
    async fn interrupt_stops_running_code() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let session = session_with(Arc::clone(&launcher));
        session.supervisor().start().await.unwrap();

        let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
        let mut relay = session.supervisor().submit(&permit, "sleep(30)").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.supervisor().interrupt().await.unwrap();
        assert_eq!(session.state(), SessionState::Interrupting);

        let mut saw_interrupt = false;
        loop {
            match relay.next_step().await {
                crate::relay::RelayStep::Event(OutputEvent::Error { name, .. }) => {
                    saw_interrupt = name == "KeyboardInterrupt";
                }
                crate::relay::RelayStep::Event(_) => {}
                crate::relay::RelayStep::Finished(completion) => {
                    assert_eq!(completion, Completion::Clean);
                    break;
                }
            }
        }
        assert!(saw_interrupt);
        assert_eq!(launcher.stats().interrupts, 1);
        drop(relay);
        drop(permit);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn restart_keeps_id_and_resets_kernel_state() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        let id = session.id();
        session.supervisor().start().await.unwrap();

        {
            let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
            let relay = session.supervisor().submit(&permit, "x = 5").await.unwrap();
            assert!(relay.collect().await.completion.is_clean());
        }

        let generation = session.supervisor().restart().await.unwrap();
        assert_eq!(generation, 2);
        assert_eq!(session.id(), id);
        assert_eq!(session.state(), SessionState::Idle);

        let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
        let report = session
            .supervisor()
            .submit(&permit, "x")
            .await
            .unwrap()
            .collect()
            .await;
        assert!(report.events.iter().any(
            |event| matches!(event, OutputEvent::Error { name, .. } if name == "NameError")
        ));
    }

    #[tokio::test]
    async fn restart_closes_in_flight_relay() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        session.supervisor().start().await.unwrap();

        let permit = acquire(&session, AcquirePolicy::Reject).await.unwrap();
        let relay = session.supervisor().submit(&permit, "sleep(30)").await.unwrap();

        let restarter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.supervisor().restart().await })
        };

        let report = relay.collect().await;
        assert_eq!(
            report.completion,
            Completion::Degraded(DegradedCause::KernelChannelClosed)
        );
        restarter.await.unwrap().unwrap();
        drop(permit);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_restart_terminates() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let session = session_with(Arc::clone(&launcher));
        session.supervisor().start().await.unwrap();

        launcher.fail_next_launches(1);
        let err = session.supervisor().restart().await.unwrap_err();
        assert!(matches!(err, GatewayError::KernelStart(_)));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_final() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        session.supervisor().start().await.unwrap();
        session.supervisor().terminate().await;
        session.supervisor().terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);

        let err = session.supervisor().restart().await.unwrap_err();
        assert!(matches!(err, GatewayError::KernelUnavailable { .. }));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let session = session_with(Arc::new(FakeKernelLauncher::new()));
        let mut rx = session.supervisor().subscribe_state();
        session.supervisor().start().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Idle);
    }
}
