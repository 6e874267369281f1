//! Call-scoped binding of the target external system.
//!
//! The system id is visible only to code running inside the future passed
//! to [`with_target_system`], on the same task. It is gone once that future
//! completes, fails, panics or is dropped.

use std::future::Future;

use extsys_core::SystemId;

tokio::task_local! {
    static TARGET_SYSTEM: SystemId;
}

/// Run `future` with `system` bound as the target system.
pub async fn with_target_system<F: Future>(system: SystemId, future: F) -> F::Output {
    TARGET_SYSTEM.scope(system, future).await
}

/// The system bound by the enclosing [`with_target_system`], if any.
pub fn current_target_system() -> Option<SystemId> {
    TARGET_SYSTEM.try_with(Clone::clone).ok()
}
