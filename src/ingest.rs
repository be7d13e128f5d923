//! Ingestion producer.
//!
//! Validates inbound readings and appends them to `reading-events` keyed by
//! site id. Nothing is written to storage here; an [`Ack`] only means the
//! event is on the bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    EventBus, FieldError, PipelineError, RawReading, Reading, SiteId, ValidationError,
    READING_EVENTS,
};

// ---

/// Acknowledgement of an accepted reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub site_id: SiteId,
    pub timestamp: DateTime<Utc>,
    pub partition: u32,
    pub offset: u64,
}

#[derive(Clone)]
pub struct IngestProducer {
    bus: EventBus,
    topic: String,
}

impl IngestProducer {
    // ---
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            topic: READING_EVENTS.to_string(),
        }
    }

    pub async fn submit(&self, raw: RawReading) -> Result<Ack, PipelineError> {
        self.submit_at(raw, Utc::now()).await
    }

    /// Same as [`submit`](Self::submit) with an explicit publish time, used
    /// as the reading timestamp when the client sent none.
    pub async fn submit_at(
        &self,
        raw: RawReading,
        now: DateTime<Utc>,
    ) -> Result<Ack, PipelineError> {
        // ---
        let reading = raw.into_reading(now)?;
        let ack = self.publish(&reading).await?;
        debug!(site_id = ack.site_id, partition = ack.partition, offset = ack.offset, "reading accepted");
        Ok(ack)
    }

    /// Validate every element first; one invalid element rejects the whole
    /// batch with its index in each field name. Nothing is published then.
    pub async fn submit_batch(&self, batch: Vec<RawReading>) -> Result<Vec<Ack>, PipelineError> {
        // ---
        let now = Utc::now();
        let mut readings = Vec::with_capacity(batch.len());
        let mut errors = Vec::new();

        for (i, raw) in batch.into_iter().enumerate() {
            match raw.into_reading(now) {
                Ok(reading) => readings.push(reading),
                Err(e) => errors.extend(
                    e.errors
                        .into_iter()
                        .map(|f| FieldError::new(format!("[{i}].{}", f.field), f.message)),
                ),
            }
        }

        if !errors.is_empty() {
            return Err(ValidationError { errors }.into());
        }

        let mut acks = Vec::with_capacity(readings.len());
        for reading in &readings {
            acks.push(self.publish(reading).await?);
        }
        info!(accepted = acks.len(), "batch accepted");
        Ok(acks)
    }

    async fn publish(&self, reading: &Reading) -> Result<Ack, PipelineError> {
        // ---
        let payload = serde_json::to_string(reading)?;
        let meta = self
            .bus
            .publish(&self.topic, &reading.partition_key(), payload)
            .await?;
        Ok(Ack {
            site_id: reading.site_id,
            timestamp: reading.timestamp,
            partition: meta.partition,
            offset: meta.offset,
        })
    }
}
