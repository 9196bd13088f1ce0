//! Push-style execution over a duplex connection.
//!
//! Each connection owns exactly one session, created when the connection is
//! accepted and destroyed when it goes away, even mid-execution. Execute
//! frames are queued and run in arrival order; output is forwarded as the
//! kernel produces it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use kernelhub_core::{
    AcquirePolicy, Completion, DegradedCause, GatewayError, KernelGateway, OutputEvent,
    RelayStep, RunningExecution, SessionId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Execute { code: String },
    Interrupt,
    Restart,
}

pub fn parse_client_frame(text: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelActivity {
    Idle,
    Busy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Clean,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionStarted {
        session_id: SessionId,
    },
    Stream {
        name: String,
        text: String,
    },
    Result {
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status {
        execution_state: KernelActivity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion: Option<CompletionKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<DegradedCause>,
    },
    Rejected {
        reason: String,
        message: String,
    },
    Interrupted,
    Restarted,
}

impl ServerFrame {
    fn rejected(err: &GatewayError) -> Self {
        ServerFrame::Rejected {
            reason: err.code().to_string(),
            message: err.to_string(),
        }
    }

    fn degraded(cause: DegradedCause) -> Self {
        ServerFrame::Status {
            execution_state: KernelActivity::Unknown,
            completion: Some(CompletionKind::Degraded),
            reason: Some(cause),
        }
    }
}

impl From<OutputEvent> for ServerFrame {
    fn from(event: OutputEvent) -> Self {
        match event {
            OutputEvent::Stream { name, text } => ServerFrame::Stream { name, text },
            OutputEvent::Result { text } => ServerFrame::Result { text },
            OutputEvent::Error {
                name,
                message,
                trace,
            } => ServerFrame::Error {
                ename: name,
                evalue: message,
                traceback: trace,
            },
            OutputEvent::StatusIdle => ServerFrame::Status {
                execution_state: KernelActivity::Idle,
                completion: Some(CompletionKind::Clean),
                reason: None,
            },
            OutputEvent::StatusBusy => ServerFrame::Status {
                execution_state: KernelActivity::Busy,
                completion: None,
                reason: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// How long a queued execute waits for the session before it is rejected.
    pub queue_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(30),
        }
    }
}

struct Closed;

type Acquisition = BoxFuture<'static, Result<RunningExecution, GatewayError>>;

struct Connection {
    gateway: Arc<KernelGateway>,
    session_id: SessionId,
    outbound: mpsc::Sender<ServerFrame>,
    options: StreamOptions,
    queue: VecDeque<String>,
    /// The queue head waiting for the session lock.
    pending: Option<Acquisition>,
    active: Option<RunningExecution>,
}

impl Connection {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), Closed> {
        self.outbound.send(frame).await.map_err(|_| Closed)
    }

    fn start_next(&mut self) {
        if self.active.is_some() || self.pending.is_some() {
            return;
        }
        let Some(code) = self.queue.pop_front() else {
            return;
        };

        let gateway = Arc::clone(&self.gateway);
        let session_id = self.session_id;
        let policy = AcquirePolicy::Wait(self.options.queue_timeout);
        let acquire = async move { gateway.execute(&session_id, &code, policy).await };
        self.pending = Some(acquire.boxed());
    }

    async fn handle_acquired(
        &mut self,
        acquired: Result<RunningExecution, GatewayError>,
    ) -> Result<(), Closed> {
        self.pending = None;
        match acquired {
            Ok(running) => {
                debug!(
                    session_id = %self.session_id,
                    request_id = %running.request_id(),
                    queued = self.queue.len(),
                    "Started streamed execution"
                );
                self.active = Some(running);
                Ok(())
            }
            Err(err) => self.send(ServerFrame::rejected(&err)).await,
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Result<ClientFrame, serde_json::Error>,
    ) -> Result<(), Closed> {
        match frame {
            Ok(ClientFrame::Execute { code }) => {
                self.queue.push_back(code);
                Ok(())
            }
            Ok(ClientFrame::Interrupt) => match self.gateway.interrupt(&self.session_id).await {
                Ok(()) => self.send(ServerFrame::Interrupted).await,
                Err(err) => self.send(ServerFrame::rejected(&err)).await,
            },
            Ok(ClientFrame::Restart) => match self.gateway.restart(&self.session_id).await {
                Ok(()) => self.send(ServerFrame::Restarted).await,
                Err(err) => self.send(ServerFrame::rejected(&err)).await,
            },
            Err(err) => {
                self.send(ServerFrame::Rejected {
                    reason: "invalid_frame".to_string(),
                    message: err.to_string(),
                })
                .await
            }
        }
    }

    async fn handle_step(&mut self, step: RelayStep) -> Result<(), Closed> {
        match step {
            RelayStep::Event(event) => self.send(event.into()).await,
            RelayStep::Finished(completion) => {
                self.active = None;
                match completion {
                    Completion::Clean => Ok(()),
                    Completion::Degraded(cause) => self.send(ServerFrame::degraded(cause)).await,
                }
            }
        }
    }
}

async fn acquisition(
    pending: &mut Option<Acquisition>,
) -> Result<RunningExecution, GatewayError> {
    match pending {
        Some(acquire) => acquire.await,
        None => std::future::pending().await,
    }
}

async fn next_step(active: &mut Option<RunningExecution>) -> RelayStep {
    match active {
        Some(running) => running.next_step().await,
        None => std::future::pending().await,
    }
}

/// Drive one connection until the client goes away.
///
/// Returns the id of the session that served the connection, which has been
/// destroyed by the time this returns, or `None` if no session could be
/// started.
pub async fn serve_connection<S>(
    gateway: Arc<KernelGateway>,
    mut inbound: S,
    outbound: mpsc::Sender<ServerFrame>,
    options: StreamOptions,
) -> Option<SessionId>
where
    S: Stream<Item = Result<ClientFrame, serde_json::Error>> + Unpin,
{
    let session_id = match gateway.start_session().await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Could not start session for stream");
            let _ = outbound.send(ServerFrame::rejected(&err)).await;
            return None;
        }
    };
    info!(session_id = %session_id, "Stream connected");

    let mut conn = Connection {
        gateway: Arc::clone(&gateway),
        session_id,
        outbound,
        options,
        queue: VecDeque::new(),
        pending: None,
        active: None,
    };

    if conn
        .send(ServerFrame::SessionStarted { session_id })
        .await
        .is_ok()
    {
        loop {
            conn.start_next();

            let outcome = tokio::select! {
                frame = inbound.next() => match frame {
                    Some(frame) => conn.handle_frame(frame).await,
                    None => Err(Closed),
                },
                acquired = acquisition(&mut conn.pending) => conn.handle_acquired(acquired).await,
                step = next_step(&mut conn.active) => conn.handle_step(step).await,
            };
            if outcome.is_err() {
                break;
            }
        }
    }

    if conn.active.is_some() {
        debug!(session_id = %session_id, "Stream closed mid-execution");
    }
    gateway.shutdown_session(&session_id).await;
    drop(conn);
    info!(session_id = %session_id, "Stream disconnected");
    Some(session_id)
}
