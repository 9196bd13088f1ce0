use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::relay::DeadlinePolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Interpreter used to run the kernel driver.
    pub program: String,
    /// Extra interpreter arguments, placed before the driver.
    pub args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
            startup_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl KernelConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub interrupt_on_timeout: bool,
    pub deadline: DeadlineConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interrupt_on_timeout: true,
            deadline: DeadlineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeadlineConfig {
    ResetOnActivity {
        #[serde(default = "default_inactivity_ms")]
        inactivity_ms: u64,
    },
    FixedTotal {
        total_ms: u64,
    },
}

fn default_inactivity_ms() -> u64 {
    2_000
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        DeadlineConfig::ResetOnActivity {
            inactivity_ms: default_inactivity_ms(),
        }
    }
}

impl DeadlineConfig {
    pub fn policy(&self) -> DeadlinePolicy {
        match *self {
            DeadlineConfig::ResetOnActivity { inactivity_ms } => DeadlinePolicy::ResetOnActivity {
                inactivity: Duration::from_millis(inactivity_ms),
            },
            DeadlineConfig::FixedTotal { total_ms } => DeadlinePolicy::FixedTotal {
                total: Duration::from_millis(total_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    /// How long a streaming client's execute waits for the session.
    pub stream_queue_timeout_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            stream_queue_timeout_ms: 30_000,
        }
    }
}

impl SessionsConfig {
    pub fn stream_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_queue_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write daily-rotated log files here.
    pub directory: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            GatewayError::Configuration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join("kernelhub").join("config.toml"))
    }

    /// Load from `path`, which must exist, or from the default location when
    /// `None`. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    tracing::debug!("No config file at {:?}, using defaults", path);
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            GatewayError::Configuration(msg) => {
                GatewayError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| GatewayError::Configuration(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kernel.program.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "kernel.program must not be empty".to_string(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(GatewayError::Configuration(
                "sessions.max_sessions must be at least 1".to_string(),
            ));
        }
        let zero_deadline = match self.relay.deadline {
            DeadlineConfig::ResetOnActivity { inactivity_ms } => inactivity_ms == 0,
            DeadlineConfig::FixedTotal { total_ms } => total_ms == 0,
        };
        if zero_deadline {
            return Err(GatewayError::Configuration(
                "relay deadline must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
