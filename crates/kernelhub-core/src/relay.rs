//! Draining a kernel's raw event channel for one execution.

use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::event::{Completion, DegradedCause, ExecutionReport, OutputEvent, classify};
use crate::kernel::KernelEvents;
use crate::session::SessionId;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the relay waits for the kernel before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePolicy {
    /// The deadline moves forward with every raw message received.
    ResetOnActivity { inactivity: Duration },
    /// One deadline for the whole execution.
    FixedTotal { total: Duration },
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        DeadlinePolicy::ResetOnActivity {
            inactivity: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStep {
    Event(OutputEvent),
    Finished(Completion),
}

/// Ordered output of one execution.
///
/// Holds the receiver of the kernel generation that was current at submit
/// time, so no other relay can read the channel concurrently. Messages whose
/// parent is not this execution's request are dropped.
///
/// `next_step` is cancel safe.
#[derive(Debug)]
pub struct OutputRelay {
    session_id: SessionId,
    request_id: String,
    generation: u64,
    events: OwnedMutexGuard<KernelEvents>,
    policy: DeadlinePolicy,
    started_at: Instant,
    last_activity: Instant,
    completion: Option<Completion>,
}

impl OutputRelay {
    pub(crate) fn new(
        session_id: SessionId,
        request_id: String,
        generation: u64,
        events: OwnedMutexGuard<KernelEvents>,
        policy: DeadlinePolicy,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            request_id,
            generation,
            events,
            policy,
            started_at: now,
            last_activity: now,
            completion: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The kernel generation whose channel this relay reads.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Set once the relay has stopped.
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    fn deadline(&self) -> Instant {
        match self.policy {
            DeadlinePolicy::ResetOnActivity { inactivity } => self.last_activity + inactivity,
            DeadlinePolicy::FixedTotal { total } => self.started_at + total,
        }
    }

    fn finish(&mut self, completion: Completion) -> RelayStep {
        if let Completion::Degraded(cause) = completion {
            debug!(
                session_id = %self.session_id,
                request_id = %self.request_id,
                %cause,
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "Execution relay degraded"
            );
        }
        self.completion = Some(completion);
        RelayStep::Finished(completion)
    }

    /// Wait for the next event of this execution.
    ///
    /// The terminal `StatusIdle` is returned as an event; the call after it
    /// returns `Finished(Clean)`. Once finished, every further call returns
    /// the same `Finished` step.
    pub async fn next_step(&mut self) -> RelayStep {
        if let Some(completion) = self.completion {
            return RelayStep::Finished(completion);
        }

        loop {
            let deadline = self.deadline();
            let msg = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return self.finish(Completion::Degraded(DegradedCause::RelayTimeout)),
                Ok(None) => {
                    return self.finish(Completion::Degraded(DegradedCause::KernelChannelClosed));
                }
                Ok(Some(msg)) => msg,
            };
            self.last_activity = Instant::now();

            if !msg.is_child_of(&self.request_id) {
                trace!(
                    session_id = %self.session_id,
                    msg_type = %msg.msg_type,
                    parent_id = ?msg.parent_id,
                    "Dropping message from another execution"
                );
                continue;
            }

            let Some(event) = classify(&msg) else {
                continue;
            };
            if event == OutputEvent::StatusIdle {
                self.completion = Some(Completion::Clean);
            }
            return RelayStep::Event(event);
        }
    }

    /// Drain the execution to the end.
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
