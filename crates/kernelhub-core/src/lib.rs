// Kernel sessions, supervision and output relaying without transport dependencies

pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod kernel;
pub mod relay;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use event::{Completion, DegradedCause, ExecutionReport, OutputEvent};
pub use gateway::{GatewayOptions, KernelGateway, RunningExecution};
pub use relay::{DeadlinePolicy, OutputRelay, RelayStep};
pub use session::{AcquirePolicy, ExecutionPermit, Session, SessionId, SessionInfo, SessionState};
