//! Command abstractions.

use uuid::Uuid;

use crate::event::EventMetadata;

/// Trait that all commands implement.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str;

    /// Correlation ID to trace this command through the system.
    fn correlation_id(&self) -> Uuid;

    /// ID of whatever caused this command. Defaults to the correlation ID,
    /// which is correct for commands entering from the outside.
    fn causation_id(&self) -> Uuid {
        self.correlation_id()
    }

    /// Metadata for the events raised while handling this command.
    fn event_metadata(&self, source: &str) -> EventMetadata {
        EventMetadata::new(source)
            .with_correlation_id(self.correlation_id())
            .with_causation_id(self.causation_id())
            .with_entry(
                "commandType",
                serde_json::Value::String(self.command_type().to_owned()),
            )
    }
}
