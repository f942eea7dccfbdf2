use async_trait::async_trait;

use crate::error::ControlError;

/// The lifecycle surface the scheduler drives. Implemented by [`crate::registry::Registry`];
/// every call fails with `ServerNotFound` for an unknown id.
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn start(&self, server_id: &str) -> Result<(), ControlError>;
    async fn stop(&self, server_id: &str) -> Result<(), ControlError>;
    async fn send_command(&self, server_id: &str, text: &str) -> Result<(), ControlError>;
}
