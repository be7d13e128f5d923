//! Dead-letter observer.
//!
//! Dead-lettered records are never retried automatically. This consumer only
//! makes them visible in the logs; the topics themselves stay readable
//! through `EventBus::read`.

use async_trait::async_trait;
use tracing::error;

use crate::{HandlerError, Record, RecordHandler};

// ---

pub struct DlqObserver;

fn header<'a>(record: &'a Record, name: &str) -> &'a str {
    record.headers.get(name).map_or("-", String::as_str)
}

#[async_trait]
impl RecordHandler for DlqObserver {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        // ---
        error!(
            dlq = %record.topic,
            offset = record.offset,
            key = %record.key,
            origin_topic = header(record, "x-original-topic"),
            origin_partition = header(record, "x-original-partition"),
            origin_offset = header(record, "x-original-offset"),
            group = header(record, "x-consumer-group"),
            attempts = header(record, "x-attempts"),
            "dead-lettered record: {}",
            header(record, "x-error")
        );
        Ok(())
    }
}
