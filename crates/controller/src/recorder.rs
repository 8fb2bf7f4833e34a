use carctl_core::{CarObject, EventRecorder, EventType, RecordError};
use tracing::{info, warn};

/// Records events as log lines. Used when no cluster event sink is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

#[async_trait::async_trait]
impl EventRecorder for LogRecorder {
    async fn record(&self, obj: &CarObject, type_: EventType, reason: &str, message: &str) -> Result<(), RecordError> {
        match type_ {
            EventType::Normal => info!(object = %obj.key, reason, "{}", message),
            EventType::Warning => warn!(object = %obj.key, reason, "{}", message),
        }
        Ok(())
    }
}
