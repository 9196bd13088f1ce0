//! The transport-independent core shared by every adapter.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::event::{Completion, DegradedCause, ExecutionReport};
use crate::kernel::{KernelLauncher, ProcessKernelLauncher};
use crate::relay::{DeadlinePolicy, OutputRelay, RelayStep};
use crate::session::{
    AcquirePolicy, ExecutionPermit, SessionId, SessionInfo, SessionRegistry, SessionState,
    acquire,
};

pub const DEFAULT_MAX_SESSIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayOptions {
    pub relay_policy: DeadlinePolicy,
    /// Interrupt the kernel when a relay gives up waiting for it.
    pub interrupt_on_timeout: bool,
    pub max_sessions: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            relay_policy: DeadlinePolicy::default(),
            interrupt_on_timeout: true,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl From<&GatewayConfig> for GatewayOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            relay_policy: config.relay.deadline.policy(),
            interrupt_on_timeout: config.relay.interrupt_on_timeout,
            max_sessions: config.sessions.max_sessions,
        }
    }
}

pub struct KernelGateway {
    registry: Arc<SessionRegistry>,
    options: GatewayOptions,
}

impl KernelGateway {
    pub fn new(launcher: Arc<dyn KernelLauncher>, options: GatewayOptions) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(
                launcher,
                options.relay_policy,
                options.max_sessions,
            )),
            options,
        }
    }

    /// A gateway backed by interpreter processes as configured.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let launcher = Arc::new(ProcessKernelLauncher::from_config(&config.kernel));
        Self::new(launcher, GatewayOptions::from(config))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub async fn start_session(&self) -> Result<SessionId> {
        self.registry.create_session().await
    }

    /// Start running `code` on a session and return the live execution.
    pub async fn execute(
        &self,
        session_id: &SessionId,
        code: &str,
        policy: AcquirePolicy,
    ) -> Result<RunningExecution> {
        let session = self.registry.lookup(session_id).await?;
        let permit = acquire(&session, policy).await?;
        let relay = session.supervisor().submit(&permit, code).await?;
        Ok(RunningExecution {
            session_id: *session_id,
            request_id: relay.request_id().to_string(),
            interrupt_on_timeout: self.options.interrupt_on_timeout,
            execution: Some(Execution {
                relay,
                permit,
                registry: Arc::clone(&self.registry),
            }),
        })
    }

    /// Run `code` to completion, rejecting if the session is busy.
    pub async fn execute_collect(
        &self,
        session_id: &SessionId,
        code: &str,
    ) -> Result<ExecutionReport> {
        let execution = self.execute(session_id, code, AcquirePolicy::Reject).await?;
        Ok(execution.collect().await)
    }

    pub async fn interrupt(&self, session_id: &SessionId) -> Result<()> {
        let session = self.registry.lookup(session_id).await?;
        session.supervisor().interrupt().await
    }

    /// Restart a session's kernel. A session whose kernel cannot be relaunched
    /// is removed.
    pub async fn restart(&self, session_id: &SessionId) -> Result<()> {
        let session = self.registry.lookup(session_id).await?;
        match session.supervisor().restart().await {
            Ok(generation) => {
                debug!(session_id = %session_id, generation, "Session restarted");
                Ok(())
            }
            Err(err @ GatewayError::KernelStart(_)) => {
                warn!(session_id = %session_id, error = %err, "Removing session after failed restart");
                self.registry.destroy_session(session_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Idempotent.
    pub async fn shutdown_session(&self, session_id: &SessionId) -> bool {
        self.registry.destroy_session(session_id).await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list_sessions().await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down kernel gateway");
        self.registry.shutdown_all().await;
    }
}

/// An execution in flight: its relay plus the permit that keeps the session
/// exclusive until the relay finishes.
///
/// Dropping it before the relay finishes interrupts the kernel and keeps the
/// session locked in the background until the kernel reports idle for the
/// abandoned request.
pub struct RunningExecution {
    session_id: SessionId,
    request_id: String,
    interrupt_on_timeout: bool,
    execution: Option<Execution>,
}

impl RunningExecution {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Like [`OutputRelay::next_step`], interrupting the kernel once if the
    /// relay times out. Cancel safe.
    pub async fn next_step(&mut self) -> RelayStep {
        match self.execution.as_mut() {
            Some(execution) => execution.next_step(self.interrupt_on_timeout).await,
            None => RelayStep::Finished(Completion::Degraded(DegradedCause::KernelChannelClosed)),
        }
    }

    pub async fn collect(mut self) -> ExecutionReport {
        let mut events = Vec::new();
        loop {
            match self.next_step().await {
                RelayStep::Event(event) => events.push(event),
                RelayStep::Finished(completion) => return ExecutionReport { events, completion },
            }
        }
    }
}

impl Drop for RunningExecution {
    fn drop(&mut self) {
        let Some(execution) = self.execution.take() else {
            return;
        };
        if execution.relay.completion().is_some() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    session_id = %self.session_id,
                    request_id = %self.request_id,
                    "Execution abandoned before completion"
                );
                handle.spawn(execution.abandon());
            }
            Err(_) => warn!(
                session_id = %self.session_id,
                request_id = %self.request_id,
                "Execution abandoned outside a runtime; session released while kernel may be busy"
            ),
        }
    }
}

struct Execution {
    // Field order matters: the relay must release the event channel before
    // the permit unlocks the session.
    relay: OutputRelay,
    permit: ExecutionPermit,
    registry: Arc<SessionRegistry>,
}

impl Execution {
    async fn next_step(&mut self, interrupt_on_timeout: bool) -> RelayStep {
        let already_finished = self.relay.completion().is_some();
        let step = self.relay.next_step().await;
        if already_finished {
            return step;
        }

        if let RelayStep::Finished(Completion::Degraded(cause)) = &step {
            match cause {
                DegradedCause::RelayTimeout if interrupt_on_timeout => {
                    self.interrupt("relay timeout").await;
                }
                DegradedCause::RelayTimeout => {}
                DegradedCause::KernelChannelClosed => self.check_kernel_lost().await,
            }
        }
        step
    }

    async fn interrupt(&self, reason: &'static str) {
        let session = self.permit.session();
        info!(
            session_id = %session.id(),
            request_id = %self.relay.request_id(),
            reason,
            "Interrupting kernel"
        );
        if let Err(err) = session.supervisor().interrupt().await {
            warn!(session_id = %session.id(), error = %err, reason, "Interrupt failed");
        }
    }

    /// A channel that closed without a restart or shutdown behind it means
    /// the kernel died; the session cannot run anything else.
    async fn check_kernel_lost(&self) {
        let session = self.permit.session();
        let supervisor = session.supervisor();
        let replaced = supervisor.generation() != self.relay.generation();
        let state = supervisor.state();
        if replaced || matches!(state, SessionState::Restarting | SessionState::Terminated) {
            return;
        }

        warn!(
            session_id = %session.id(),
            generation = self.relay.generation(),
            %state,
            "Kernel exited unexpectedly; removing session"
        );
        supervisor.terminate().await;
        self.registry.destroy_session(&session.id()).await;
    }

    /// Interrupt and drain until the kernel finishes the request, holding the
    /// permit throughout.
    async fn abandon(mut self) {
        self.interrupt("execution abandoned").await;
        let mut dropped = 0usize;
        let completion = loop {
            match self.next_step(false).await {
                RelayStep::Event(_) => dropped += 1,
                RelayStep::Finished(completion) => break completion,
            }
        };
        debug!(
            session_id = %self.permit.session_id(),
            request_id = %self.relay.request_id(),
            dropped,
            ?completion,
            "Drained abandoned execution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OutputEvent;
    use crate::test_utils::FakeKernelLauncher;
    use std::time::Duration;

    fn gateway_with(launcher: Arc<FakeKernelLauncher>) -> KernelGateway {
        KernelGateway::new(
            launcher,
            GatewayOptions {
                relay_policy: DeadlinePolicy::ResetOnActivity {
                    inactivity: Duration::from_millis(200),
                },
                ..GatewayOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn print_produces_stream_then_idle() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        let report = gateway.execute_collect(&id, "print(\"hi\")").await.unwrap();
        assert_eq!(report.completion, Completion::Clean);
        assert_eq!(
            report.output().cloned().collect::<Vec<_>>(),
            vec![OutputEvent::Stream {
                name: "stdout".into(),
                text: "hi\n".into()
            }]
        );
        assert_eq!(report.events.last(), Some(&OutputEvent::StatusIdle));
    }

    #[tokio::test]
    async fn raise_produces_error_then_idle() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        let report = gateway
            .execute_collect(&id, "raise ValueError(\"bad\")")
            .await
            .unwrap();
        assert!(report.completion.is_clean());
        let output: Vec<_> = report.output().collect();
        assert!(matches!(
            output.as_slice(),
            [OutputEvent::Error { name, message, .. }] if name == "ValueError" && message == "bad"
        ));
        assert_eq!(report.events.last(), Some(&OutputEvent::StatusIdle));
    }

    #[tokio::test]
    async fn state_persists_between_executions() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        gateway.execute_collect(&id, "answer = 42").await.unwrap();
        let report = gateway.execute_collect(&id, "answer").await.unwrap();
        assert!(report
            .output()
            .any(|event| *event == OutputEvent::Result { text: "42".into() }));
    }

    #[tokio::test]
    async fn timeout_interrupts_and_session_stays_usable() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = gateway_with(Arc::clone(&launcher));
        let id = gateway.start_session().await.unwrap();

        let report = gateway.execute_collect(&id, "sleep(30)").await.unwrap();
        assert_eq!(
            report.completion,
            Completion::Degraded(DegradedCause::RelayTimeout)
        );
        assert_eq!(launcher.stats().interrupts, 1);

        let session = gateway.registry().lookup(&id).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        let report = gateway.execute_collect(&id, "print(\"again\")").await.unwrap();
        assert!(report.completion.is_clean());
        assert!(!report.has_error());
    }

    #[tokio::test]
    async fn timeout_without_interrupt_leaves_kernel_running() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = KernelGateway::new(
            Arc::clone(&launcher) as Arc<dyn KernelLauncher>,
            GatewayOptions {
                relay_policy: DeadlinePolicy::FixedTotal {
                    total: Duration::from_millis(200),
                },
                interrupt_on_timeout: false,
                ..GatewayOptions::default()
            },
        );
        let id = gateway.start_session().await.unwrap();

        let report = gateway.execute_collect(&id, "sleep(0.3)").await.unwrap();
        assert_eq!(report.completion.degraded_cause(), Some(DegradedCause::RelayTimeout));
        assert_eq!(launcher.stats().interrupts, 0);

        // The earlier execution's output is filtered out of this one.
        let report = gateway.execute_collect(&id, "print(\"next\")").await.unwrap();
        assert!(report.completion.is_clean());
        assert_eq!(report.output().count(), 1);
    }

    #[tokio::test]
    async fn concurrent_execute_is_rejected() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        let running = gateway
            .execute(&id, "sleep(0.1)", AcquirePolicy::Reject)
            .await
            .unwrap();
        let err = gateway.execute_collect(&id, "1").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionBusy { .. }));

        assert!(running.collect().await.completion.is_clean());
        assert!(gateway.execute_collect(&id, "1").await.is_ok());
    }

    #[tokio::test]
    async fn queued_executions_never_overlap() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = Arc::new(gateway_with(Arc::clone(&launcher)));
        let id = gateway.start_session().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    let running = gateway
                        .execute(
                            &id,
                            &format!("print(\"{i}\")"),
                            AcquirePolicy::Wait(Duration::from_secs(10)),
                        )
                        .await?;
                    Ok::<_, GatewayError>(running.collect().await)
                })
            })
            .collect();

        for task in tasks {
            let report = task.await.unwrap().unwrap();
            assert!(report.completion.is_clean());
            assert_eq!(report.output().count(), 1);
        }
        assert_eq!(launcher.stats().max_outstanding, 1);
    }

    #[tokio::test]
    async fn dropped_execution_keeps_session_until_kernel_idle() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = gateway_with(Arc::clone(&launcher));
        let id = gateway.start_session().await.unwrap();

        let running = gateway
            .execute(&id, "sleep(2)", AcquirePolicy::Reject)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(running);

        let err = gateway.execute_collect(&id, "1").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionBusy { .. }));

        let report = gateway
            .execute(&id, "print(\"next\")", AcquirePolicy::Wait(Duration::from_secs(5)))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(report.completion.is_clean());
        assert_eq!(
            report.output().cloned().collect::<Vec<_>>(),
            vec![OutputEvent::Stream {
                name: "stdout".into(),
                text: "next\n".into()
            }]
        );
        assert_eq!(launcher.stats().interrupts, 1);
        assert_eq!(launcher.stats().max_outstanding, 1);
    }

    #[tokio::test]
    async fn finished_execution_drops_without_interrupt() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = gateway_with(Arc::clone(&launcher));
        let id = gateway.start_session().await.unwrap();

        let mut running = gateway
            .execute(&id, "1", AcquirePolicy::Reject)
            .await
            .unwrap();
        loop {
            match running.next_step().await {
                RelayStep::Event(OutputEvent::StatusIdle) => break,
                RelayStep::Event(_) => {}
                RelayStep::Finished(completion) => panic!("finished before idle: {completion:?}"),
            }
        }
        drop(running);

        assert!(gateway.execute_collect(&id, "2").await.is_ok());
        assert_eq!(launcher.stats().interrupts, 0);
    }

    #[tokio::test]
    async fn dead_kernel_ends_session() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        let report = gateway
            .execute_collect(&id, "print(\"bye\")\nexit()")
            .await
            .unwrap();
        assert_eq!(
            report.completion,
            Completion::Degraded(DegradedCause::KernelChannelClosed)
        );
        assert_eq!(report.output().count(), 1);

        let err = gateway.execute_collect(&id, "1").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound { .. }));
        assert!(gateway.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn restart_during_execution_keeps_session() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();

        let running = gateway
            .execute(&id, "sleep(30)", AcquirePolicy::Reject)
            .await
            .unwrap();
        let (report, restarted) = tokio::join!(running.collect(), gateway.restart(&id));
        restarted.unwrap();
        assert_eq!(
            report.completion,
            Completion::Degraded(DegradedCause::KernelChannelClosed)
        );

        let session = gateway.registry().lookup(&id).await.unwrap();
        assert_eq!(session.supervisor().generation(), 2);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(gateway.execute_collect(&id, "1").await.unwrap().completion.is_clean());
    }

    #[tokio::test]
    async fn failed_restart_removes_session() {
        let launcher = Arc::new(FakeKernelLauncher::new());
        let gateway = gateway_with(Arc::clone(&launcher));
        let id = gateway.start_session().await.unwrap();

        launcher.fail_next_launches(1);
        let err = gateway.restart(&id).await.unwrap_err();
        assert!(matches!(err, GatewayError::KernelStart(_)));
        assert!(matches!(
            gateway.execute_collect(&id, "1").await.unwrap_err(),
            GatewayError::SessionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_then_execute_is_not_found() {
        let gateway = gateway_with(Arc::new(FakeKernelLauncher::new()));
        let id = gateway.start_session().await.unwrap();
        assert!(gateway.shutdown_session(&id).await);
        assert!(!gateway.shutdown_session(&id).await);
        let err = gateway.execute_collect(&id, "1").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound { .. }));
    }
}
