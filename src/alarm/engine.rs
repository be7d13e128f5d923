//! Alarm engine consumer on `reading-events`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    evaluate, AlarmThresholds, Envelope, EventBus, HandlerError, PushHub, Reading, Record,
    RecordHandler, ALARM_EVENTS,
};

// ---

pub struct AlarmEngine {
    bus: EventBus,
    push: PushHub,
    thresholds: Arc<AlarmThresholds>,
}

impl AlarmEngine {
    pub fn new(bus: EventBus, push: PushHub, thresholds: Arc<AlarmThresholds>) -> Self {
        Self {
            bus,
            push,
            thresholds,
        }
    }
}

#[async_trait]
impl RecordHandler for AlarmEngine {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        // ---
        let reading: Reading = serde_json::from_str(&record.payload)?;
        let alarms = evaluate(&reading, &self.thresholds);
        if alarms.is_empty() {
            debug!(site_id = reading.site_id, "no thresholds crossed");
            return Ok(());
        }

        // Encode everything first so a failure publishes nothing
        let mut encoded = Vec::with_capacity(alarms.len());
        for alarm in alarms {
            let json = serde_json::to_string(&alarm)?;
            let envelope = Envelope::alarm(&alarm)?;
            encoded.push((alarm, json, envelope));
        }

        for (alarm, json, envelope) in encoded {
            self.bus
                .publish(ALARM_EVENTS, &alarm.partition_key(), json)
                .await
                .map_err(HandlerError::from)?;
            self.push.publish(alarm.site_id, envelope);

            info!(
                site_id = alarm.site_id,
                alarm_type = %alarm.alarm_type,
                severity = alarm.severity.as_str(),
                "{}",
                alarm.message
            );
        }
        Ok(())
    }
}
