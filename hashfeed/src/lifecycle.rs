//! Start/stop capability shared by the scheduler's long-lived parts.

use async_trait::async_trait;

/// An entity with background activity that can be started and stopped.
///
/// Both operations are idempotent. `stop` waits for the entity's background
/// tasks, bounded by the entity's own shutdown timeout.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> crate::Result<()>;

    async fn stop(&self);

    fn is_running(&self) -> bool;
}
