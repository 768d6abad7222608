use crate::anomaly::AnomalyEvent;
use crate::reading::EnrichedReading;
use anyhow::{Context, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Registry status of a tracked vehicle, read from the external fleet registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityStatus {
    Active,
    Idle,
    Charging,
    Maintenance,
    OutOfService,
}

/// External fleet-registry lookup. Read-only.
pub trait EntityRegistry: Send + Sync {
    fn status_of(&self, agv_id: &str) -> EntityStatus;
}

/// A registry that reports every vehicle as ACTIVE.
///
/// Stands in when no registry endpoint is configured; restricted-zone
/// authorization then denies everything, which is the safe default.
pub struct DefaultRegistry;

impl EntityRegistry for DefaultRegistry {
    fn status_of(&self, _agv_id: &str) -> EntityStatus {
        EntityStatus::Active
    }
}

/// Write contract of the durable store.
///
/// Batch writes are all-or-nothing: a failed batch is retried as a unit,
/// never split. Event writes are fire-and-forget from the pipeline's
/// perspective.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Write one batch of enriched readings. Returns the count written.
    async fn write_batch(&self, batch: &[EnrichedReading]) -> Result<usize>;

    /// Write one anomaly event.
    async fn write_event(&self, event: &AnomalyEvent) -> Result<()>;

    /// Release sink resources. Called once at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink configuration
#[derive(Clone, Debug, Deserialize)]
pub struct SinkConfig {
    /// Subject enriched position batches are published to
    #[serde(default = "default_batch_subject")]
    pub batch_subject: String,
    /// Subject anomaly events are published to
    #[serde(default = "default_event_subject")]
    pub event_subject: String,
}

fn default_batch_subject() -> String {
    "rtls.enriched.batch".to_string()
}

fn default_event_subject() -> String {
    "rtls.events.anomaly".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_subject: default_batch_subject(),
            event_subject: default_event_subject(),
        }
    }
}

/// Persistence sink backed by JetStream publishes.
///
/// The durable store's writer consumes these subjects; the store driver
/// itself stays external to this crate. A batch is one publish, so the
/// all-or-nothing write contract holds.
pub struct JetStreamSink {
    jetstream: jetstream::Context,
    config: SinkConfig,
}

impl JetStreamSink {
    pub fn new(jetstream: jetstream::Context, config: SinkConfig) -> Self {
        Self { jetstream, config }
    }
}

#[async_trait]
impl PersistenceSink for JetStreamSink {
    async fn write_batch(&self, batch: &[EnrichedReading]) -> Result<usize> {
        let payload = serde_json::to_vec(batch).context("Failed to serialize batch")?;

        debug!(
            subject = %self.config.batch_subject,
            records = batch.len(),
            "Publishing enriched batch"
        );

        self.jetstream
            .publish(self.config.batch_subject.clone(), payload.into())
            .await
            .context("Failed to publish batch")?
            .await
            .context("Failed to await batch publish ack")?;

        Ok(batch.len())
    }

    async fn write_event(&self, event: &AnomalyEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("Failed to serialize event")?;

        debug!(
            subject = %self.config.event_subject,
            event_id = %event.event_id,
            "Publishing anomaly event"
        );

        self.jetstream
            .publish(self.config.event_subject.clone(), payload.into())
            .await
            .context("Failed to publish event")?
            .await
            .context("Failed to await event publish ack")?;

        Ok(())
    }
}
