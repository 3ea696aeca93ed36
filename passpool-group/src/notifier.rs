use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use passpool_core::events::EventSink;
use passpool_shared::models::events::{ChangeReason, GroupDissolvedEvent, TripChangedEvent};
use passpool_shared::TripId;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Fans committed changes out to in-process subscribers and external sinks.
///
/// Publishing never blocks and never fails: the broadcast channel drops the oldest
/// events for slow receivers, and sinks run on their own tasks.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<TripChangedEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn publish(&self, event: TripChangedEvent) {
        // Err only means nobody is listening right now
        let receivers = self.tx.send(event.clone()).unwrap_or(0);
        debug!(trip = %event.trip_id, version = event.version, receivers, "Published trip change");

        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.trip_changed(&event).await {
                    warn!(sink = sink.name(), trip = %event.trip_id, error = %e, "Failed to forward trip change");
                }
            });
        }
    }

    pub fn publish_dissolved(&self, event: GroupDissolvedEvent) {
        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.group_dissolved(&event).await {
                    warn!(sink = sink.name(), trip = %event.trip_id, error = %e, "Failed to forward group dissolution");
                }
            });
        }
    }

    /// Change signals for one trip, in commit order.
    ///
    /// A subscriber that falls behind receives a single `Resync` signal in place of
    /// the events it missed.
    pub fn subscribe(&self, trip_id: TripId) -> impl Stream<Item = TripChangedEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |result| {
            let trip_id = trip_id.clone();
            async move {
                match result {
                    Ok(event) if event.trip_id == trip_id => Some(event),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(trip = %trip_id, skipped, "Subscriber lagged, asking for resync");
                        Some(TripChangedEvent {
                            trip_id,
                            version: 0,
                            reason: ChangeReason::Resync,
                            changed_at: chrono::Utc::now().timestamp(),
                        })
                    }
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
