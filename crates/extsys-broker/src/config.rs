//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Environment variable naming the worker executable.
pub const WORKER_BIN_ENV: &str = "EXTSYS_WORKER_BIN";

/// Environment variable that turns on the worker's debug-attach flag.
pub const DEBUG_PORT_ENV: &str = "EXTSYS_WORKER_DEBUG_PORT";

/// Environment variable overriding the connection timeout, in seconds.
pub const CONNECTION_TIMEOUT_ENV: &str = "EXTSYS_CONNECTION_TIMEOUT_SECS";

/// Workers may resolve dependencies over the network before they become
/// reachable, so the handshake window is an hour rather than seconds.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Worker executable. A bare name is looked up on `PATH`.
    pub worker_program: PathBuf,

    /// Entry point passed to the worker.
    pub entry_point: String,

    /// Working directory for workers whose key is not a directory.
    pub fallback_working_dir: PathBuf,

    /// How long a worker may take to publish its facade. Also handed to the
    /// worker as its own connection timeout.
    pub connection_timeout: Duration,

    /// Upper bound on a single liveness probe.
    pub probe_timeout: Duration,

    /// How long `stop_all(true)` waits for each worker to exit.
    pub stop_grace: Duration,

    /// Debug-attach port passed to workers, if any.
    pub debug_port: Option<u16>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_program: PathBuf::from("extsys-worker"),
            entry_point: "extsys.worker.RemoteExternalSystemFacade".to_string(),
            fallback_working_dir: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            probe_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            debug_port: None,
        }
    }
}

impl BrokerConfig {
    /// Defaults overridden by `EXTSYS_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(program) = std::env::var(WORKER_BIN_ENV) {
            config.worker_program = PathBuf::from(program);
        }

        if let Ok(port) = std::env::var(DEBUG_PORT_ENV) {
            match port.parse() {
                Ok(port) => config.debug_port = Some(port),
                Err(e) => warn!(value = %port, error = %e, "Ignoring invalid {}", DEBUG_PORT_ENV),
            }
        }

        if let Ok(secs) = std::env::var(CONNECTION_TIMEOUT_ENV) {
            match secs.parse() {
                Ok(secs) => config.connection_timeout = Duration::from_secs(secs),
                Err(e) => warn!(value = %secs, error = %e, "Ignoring invalid {}", CONNECTION_TIMEOUT_ENV),
            }
        }

        config
    }

    /// Builder method to set the worker executable.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    /// Builder method to set the entry point.
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Builder method to set the fallback working directory.
    pub fn with_fallback_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_working_dir = dir.into();
        self
    }

    /// Builder method to set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Builder method to set the liveness probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Builder method to set the stop grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Builder method to set the debug-attach port.
    pub fn with_debug_port(mut self, port: u16) -> Self {
        self.debug_port = Some(port);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(3600));
        assert_eq!(config.worker_program, PathBuf::from("extsys-worker"));
        assert!(config.debug_port.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = BrokerConfig::default()
            .with_worker_program("/opt/extsys/worker")
            .with_connection_timeout(Duration::from_secs(30))
            .with_stop_grace(Duration::from_secs(1))
            .with_debug_port(5005);

        assert_eq!(config.worker_program, PathBuf::from("/opt/extsys/worker"));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(1));
        assert_eq!(config.debug_port, Some(5005));
    }
}
