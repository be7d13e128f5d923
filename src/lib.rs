//! `envpulse`: real-time environmental telemetry pipeline.
//!
//! Readings enter through the [`IngestProducer`], land on the in-process
//! [`EventBus`], and fan out to independent consumer groups:
//! - persistence (system of record, write-through cache, DATA push)
//! - alarm engine (threshold evaluation, alarm events, ALARM push)
//! - statistics (running daily aggregates, STAT push)
//!
//! This module is the gateway of the Explicit Module Boundary Pattern (EMBP):
//! every sibling module imports shared types through `crate::...` re-exports
//! declared here, never through another module's path.

pub mod alarm;
pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod ingest;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod push;
pub mod routes;
pub mod schema;
pub mod stats;
pub mod store;

pub use alarm::{evaluate, AlarmActions, AlarmEngine, AlarmRecorder, AlarmThresholds, Band};
pub use auth::{HttpTokenValidator, OperatorContext, TokenValidator, UnavailableValidator};
pub use bus::{
    spawn_consumer, ConsumerGroup, ConsumerHandle, ConsumerSpec, ConsumerStats, EventBus, Record,
    RecordHandler, RecordMeta, RetryPolicy, ALARM_DLQ, ALARM_EVENTS, READING_DLQ, READING_EVENTS,
};
pub use cache::{
    CacheBackend, CacheSettings, CacheStore, Lookup, MemoryCache, RedisCache, TelemetryCache,
    NULL_MARKER,
};
pub use config::Config;
pub use dead_letter::DlqObserver;
pub use error::{FieldError, HandlerError, PipelineError, TransitionError, ValidationError};
pub use ingest::{Ack, IngestProducer};
pub use models::{
    Alarm, AlarmAction, AlarmStatus, AlarmType, DailyAggregate, MetricSet, MetricSummary,
    RawReading, Reading, Severity, SiteId, DEFAULT_SOURCE,
};
pub use persistence::PersistenceConsumer;
pub use pipeline::{GroupStatus, Pipeline, PipelineSettings, PipelineStatus};
pub use push::{Delivery, Envelope, EventKind, PushHub, PushStats, Subscription, SubscriberId};
pub use stats::StatisticsAggregator;
pub use store::{MemoryStore, PgStore, Store};
