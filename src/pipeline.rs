//! Pipeline wiring: topics, consumer groups, startup and shutdown.
//!
//! ```text
//! IngestProducer -> reading-events -+-> reading-persistence-group -> store, cache, DATA push
//!                                   +-> alarm-engine-group -> alarm-events, ALARM push
//!                                   +-> statistics-group -> daily aggregate, STAT push
//! alarm-events -> alarm-recorder-group -> store
//! *-dlq -> dlq observers (log only)
//! ```
//!
//! Every group runs its own tasks and commits its own offsets, so a stalled
//! group only grows its own lag.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    spawn_consumer, AlarmActions, AlarmEngine, AlarmRecorder, AlarmThresholds, CacheBackend,
    CacheSettings, ConsumerHandle, ConsumerSpec, DlqObserver, EventBus, IngestProducer,
    PersistenceConsumer, PushHub, PushStats, RetryPolicy, StatisticsAggregator, Store,
    TelemetryCache, ALARM_DLQ, ALARM_EVENTS, READING_DLQ, READING_EVENTS,
};

// ---

pub const PERSISTENCE_GROUP: &str = "reading-persistence-group";
pub const ALARM_ENGINE_GROUP: &str = "alarm-engine-group";
pub const STATISTICS_GROUP: &str = "statistics-group";
pub const ALARM_RECORDER_GROUP: &str = "alarm-recorder-group";
pub const READING_DLQ_GROUP: &str = "dlq-reading-group";
pub const ALARM_DLQ_GROUP: &str = "dlq-alarm-group";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub reading_partitions: u32,
    pub alarm_partitions: u32,
    /// Records retained per partition.
    pub retention: usize,
    pub retry: RetryPolicy,
    pub cache: CacheSettings,
    pub subscriber_buffer: usize,
    pub thresholds: AlarmThresholds,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reading_partitions: 5,
            alarm_partitions: 2,
            retention: 100_000,
            retry: RetryPolicy::default(),
            cache: CacheSettings::default(),
            subscriber_buffer: 256,
            thresholds: AlarmThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub topic: String,
    pub group: String,
    pub lag: u64,
    pub skipped: u64,
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub groups: Vec<GroupStatus>,
    pub dead_letters: Vec<(String, u64)>,
    pub push: PushStats,
}

impl PipelineStatus {
    pub fn total_lag(&self) -> u64 {
        self.groups.iter().map(|g| g.lag).sum()
    }
}

pub struct Pipeline {
    bus: EventBus,
    store: Arc<dyn Store>,
    cache: TelemetryCache,
    push: PushHub,
    producer: IngestProducer,
    statistics: Arc<StatisticsAggregator>,
    alarm_actions: AlarmActions,
    consumers: Mutex<Vec<ConsumerHandle>>,
    cancel: CancellationToken,
}

impl Pipeline {
    // ---
    /// Create the topics and start every consumer group. Must be called from
    /// within a tokio runtime.
    pub fn start(settings: PipelineSettings, store: Arc<dyn Store>, backend: CacheBackend) -> Self {
        // ---
        let bus = EventBus::new(settings.reading_partitions, settings.retention);
        bus.create_topic(READING_EVENTS, settings.reading_partitions);
        bus.create_topic(ALARM_EVENTS, settings.alarm_partitions);
        bus.create_topic(READING_DLQ, 1);
        bus.create_topic(ALARM_DLQ, 1);

        let cache = TelemetryCache::new(backend, store.clone(), settings.cache.clone());
        let push = PushHub::new(settings.subscriber_buffer);
        let statistics = Arc::new(StatisticsAggregator::new(
            store.clone(),
            cache.clone(),
            push.clone(),
        ));
        let cancel = CancellationToken::new();
        let retry = settings.retry.clone();

        let consumers = vec![
            spawn_consumer(
                &bus,
                ConsumerSpec::new(READING_EVENTS, PERSISTENCE_GROUP)
                    .dead_letter(READING_DLQ)
                    .retry(retry.clone()),
                Arc::new(PersistenceConsumer::new(store.clone(), cache.clone(), push.clone())),
                cancel.clone(),
            ),
            spawn_consumer(
                &bus,
                ConsumerSpec::new(READING_EVENTS, ALARM_ENGINE_GROUP)
                    .dead_letter(ALARM_DLQ)
                    .retry(retry.clone()),
                Arc::new(AlarmEngine::new(
                    bus.clone(),
                    push.clone(),
                    Arc::new(settings.thresholds.clone()),
                )),
                cancel.clone(),
            ),
            spawn_consumer(
                &bus,
                ConsumerSpec::new(READING_EVENTS, STATISTICS_GROUP).retry(retry.clone()),
                statistics.clone(),
                cancel.clone(),
            ),
            spawn_consumer(
                &bus,
                ConsumerSpec::new(ALARM_EVENTS, ALARM_RECORDER_GROUP)
                    .dead_letter(ALARM_DLQ)
                    .retry(retry),
                Arc::new(AlarmRecorder::new(store.clone())),
                cancel.clone(),
            ),
            spawn_consumer(
                &bus,
                ConsumerSpec::new(READING_DLQ, READING_DLQ_GROUP).retry(RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                }),
                Arc::new(DlqObserver),
                cancel.clone(),
            ),
            spawn_consumer(
                &bus,
                ConsumerSpec::new(ALARM_DLQ, ALARM_DLQ_GROUP).retry(RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                }),
                Arc::new(DlqObserver),
                cancel.clone(),
            ),
        ];

        info!(groups = consumers.len(), "pipeline started");

        Self {
            producer: IngestProducer::new(bus.clone()),
            alarm_actions: AlarmActions::new(store.clone(), push.clone()),
            bus,
            store,
            cache,
            push,
            statistics,
            consumers: Mutex::new(consumers),
            cancel,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &TelemetryCache {
        &self.cache
    }

    pub fn push(&self) -> &PushHub {
        &self.push
    }

    pub fn producer(&self) -> &IngestProducer {
        &self.producer
    }

    pub fn statistics(&self) -> &Arc<StatisticsAggregator> {
        &self.statistics
    }

    pub fn alarm_actions(&self) -> &AlarmActions {
        &self.alarm_actions
    }

    pub fn status(&self) -> PipelineStatus {
        // ---
        let groups = self
            .consumers
            .lock()
            .iter()
            .map(|c| {
                let cursors = self.bus.subscribe(&c.topic, &c.group);
                GroupStatus {
                    topic: c.topic.clone(),
                    group: c.group.clone(),
                    lag: cursors.lag(),
                    skipped: cursors.skipped(),
                    processed: c.stats.processed(),
                    retried: c.stats.retried(),
                    dead_lettered: c.stats.dead_lettered(),
                    dropped: c.stats.dropped(),
                }
            })
            .collect();

        PipelineStatus {
            groups,
            dead_letters: [READING_DLQ, ALARM_DLQ]
                .into_iter()
                .map(|t| (t.to_string(), self.bus.len(t)))
                .collect(),
            push: self.push.stats(),
        }
    }

    /// Wait until every group has committed everything published so far.
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        // ---
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().total_lag() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Drain for at most `drain`, then stop every consumer group.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self, drain: Duration) {
        // ---
        if !self.is_running() {
            return;
        }
        if !self.wait_idle(drain).await {
            warn!(lag = self.status().total_lag(), "shutting down with unprocessed records");
        }
        self.cancel.cancel();
        self.bus.close();

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.join().await;
        }
        info!("pipeline stopped");
    }
}
