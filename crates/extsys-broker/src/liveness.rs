//! Cheap liveness checks for facades.

use std::time::Duration;

use extsys_remote::{innermost, FacadeKind, SharedFacade};
use tracing::debug;

/// Tells whether a facade still reaches a live worker.
#[derive(Debug, Clone, Copy)]
pub struct LivenessProbe {
    timeout: Duration,
}

impl LivenessProbe {
    /// A probe that gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe `facade` with a side-effect-free call.
    ///
    /// Decorators are looked through. An in-process facade never counts as
    /// alive. Only a broken channel or a timeout means dead; any other
    /// failure still proves the worker answered.
    pub async fn is_alive(&self, facade: &SharedFacade) -> bool {
        let target = innermost(facade);
        if target.kind() == FacadeKind::InProcess {
            return false;
        }

        match tokio::time::timeout(self.timeout, target.get_resolver()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if e.is_communication() => {
                debug!(error = %e, "Liveness probe: worker unreachable");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Liveness probe: worker answered with an error");
                true
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Liveness probe timed out");
                false
            }
        }
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
