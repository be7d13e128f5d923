//! Alarm recorder consumer on `alarm-events`: persists every alarm.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{Alarm, HandlerError, PipelineError, Record, RecordHandler, Store};

// ---

pub struct AlarmRecorder {
    store: Arc<dyn Store>,
}

impl AlarmRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecordHandler for AlarmRecorder {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        // ---
        let alarm: Alarm = serde_json::from_str(&record.payload)?;
        let inserted = self
            .store
            .insert_alarm(&alarm)
            .await
            .map_err(PipelineError::storage)?;

        if inserted {
            debug!(alarm_id = %alarm.id, site_id = alarm.site_id, "alarm recorded");
        } else {
            warn!(alarm_id = %alarm.id, "alarm already recorded, redelivery ignored");
        }
        Ok(())
    }
}
