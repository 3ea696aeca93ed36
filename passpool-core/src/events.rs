use async_trait::async_trait;
use passpool_shared::models::events::{GroupDissolvedEvent, TripChangedEvent};

/// External destination for change events (message bus, webhook relay).
///
/// Sinks are best-effort: the notifier logs failures and never surfaces them.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn trip_changed(
        &self,
        event: &TripChangedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn group_dissolved(
        &self,
        event: &GroupDissolvedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
