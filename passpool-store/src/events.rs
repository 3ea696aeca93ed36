use async_trait::async_trait;
use passpool_core::events::EventSink;
use passpool_shared::models::events::{GroupDissolvedEvent, TripChangedEvent};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};

/// Publishes trip change events to Kafka, keyed by trip so one trip stays on one partition
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }

    pub async fn publish(&self, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent message to {}/{}: partition {} offset {}",
                    self.topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", self.topic, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventSink for EventProducer {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn trip_changed(
        &self,
        event: &TripChangedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let payload = serde_json::to_string(event)?;
        self.publish(&event.trip_id.key(), &payload).await?;
        Ok(())
    }

    async fn group_dissolved(
        &self,
        event: &GroupDissolvedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let payload = serde_json::to_string(event)?;
        self.publish(&event.trip_id.key(), &payload).await?;
        Ok(())
    }
}
