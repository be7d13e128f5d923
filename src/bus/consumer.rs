//! Consumer runner: one task per partition, bounded redelivery with
//! exponential backoff, then dead-letter.
//!
//! A record's offset is committed only after its outcome is final (handled,
//! dead-lettered, or dropped with an error log). A runner interrupted by
//! shutdown leaves the record uncommitted so the group sees it again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConsumerGroup, EventBus, Record};
use crate::HandlerError;

// ---

/// Processing step of one consumer group.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError>;
}

/// Exponential backoff between redeliveries of a transiently failing record.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Redeliveries after the first failed attempt.
    pub max_retries: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivery number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        // ---
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// What a consumer group reads and where its failures go.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub topic: String,
    pub group: String,
    /// `None` means failures are logged and skipped.
    pub dead_letter: Option<String>,
    pub retry: RetryPolicy,
}

impl ConsumerSpec {
    pub fn new(topic: &str, group: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            dead_letter: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn dead_letter(mut self, topic: &str) -> Self {
        self.dead_letter = Some(topic.to_string());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-group delivery counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

impl ConsumerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A running consumer group.
pub struct ConsumerHandle {
    pub topic: String,
    pub group: String,
    pub stats: Arc<ConsumerStats>,
    handles: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Wait for every partition task to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(topic = %self.topic, group = %self.group, "consumer task failed: {e}");
            }
        }
    }
}

/// Start `handler` as consumer group `spec.group` on `spec.topic`, one task
/// per partition. The tasks run until `cancel` fires or the bus closes.
pub fn spawn_consumer(
    bus: &EventBus,
    spec: ConsumerSpec,
    handler: Arc<dyn RecordHandler>,
    cancel: CancellationToken,
) -> ConsumerHandle {
    // ---
    let consumer = bus.subscribe(&spec.topic, &spec.group);
    let stats = Arc::new(ConsumerStats::default());
    let spec = Arc::new(spec);

    info!(
        topic = %spec.topic,
        group = %spec.group,
        partitions = consumer.partitions(),
        dead_letter = ?spec.dead_letter,
        "starting consumer group"
    );

    let handles = (0..consumer.partitions())
        .map(|partition| {
            let worker = PartitionWorker {
                bus: bus.clone(),
                consumer: consumer.clone(),
                partition,
                spec: spec.clone(),
                handler: handler.clone(),
                stats: stats.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect();

    ConsumerHandle {
        topic: spec.topic.clone(),
        group: spec.group.clone(),
        stats,
        handles,
    }
}

// ---

enum Outcome {
    Handled,
    Failed { error: HandlerError, attempts: u32 },
    Interrupted,
}

struct PartitionWorker {
    bus: EventBus,
    consumer: ConsumerGroup,
    partition: u32,
    spec: Arc<ConsumerSpec>,
    handler: Arc<dyn RecordHandler>,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    // ---
    async fn run(self) {
        // ---
        while let Some(record) = self.consumer.next(self.partition, &self.cancel).await {
            match self.deliver(&record).await {
                Outcome::Handled => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Failed { error, attempts } => {
                    if !self.route_failure(&record, &error, attempts).await {
                        break;
                    }
                }
                Outcome::Interrupted => break,
            }
            self.consumer.commit(self.partition, record.offset + 1);
        }
        debug!(
            topic = %self.spec.topic,
            group = %self.spec.group,
            partition = self.partition,
            "consumer partition stopped"
        );
    }

    async fn deliver(&self, record: &Record) -> Outcome {
        // ---
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match self.handler.handle(record).await {
                Ok(()) => return Outcome::Handled,
                Err(error) => error,
            };

            let retry = attempts;
            if matches!(error, HandlerError::Poison(_)) || retry > self.spec.retry.max_retries {
                return Outcome::Failed { error, attempts };
            }

            let delay = self.spec.retry.delay(retry);
            warn!(
                topic = %record.topic,
                group = %self.spec.group,
                partition = record.partition,
                offset = record.offset,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "{error}, redelivering"
            );
            self.stats.retried.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Outcome::Interrupted,
            }
        }
    }

    /// Returns `false` when the failure could not be routed and the record
    /// must stay uncommitted.
    async fn route_failure(&self, record: &Record, error: &HandlerError, attempts: u32) -> bool {
        // ---
        let Some(dlq) = &self.spec.dead_letter else {
            error!(
                topic = %record.topic,
                group = %self.spec.group,
                partition = record.partition,
                offset = record.offset,
                attempts,
                "{error}, dropping record"
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        };

        let mut headers = BTreeMap::new();
        headers.insert("x-original-topic".to_string(), record.topic.clone());
        headers.insert("x-original-partition".to_string(), record.partition.to_string());
        headers.insert("x-original-offset".to_string(), record.offset.to_string());
        headers.insert("x-consumer-group".to_string(), self.spec.group.clone());
        headers.insert("x-error".to_string(), error.to_string());
        headers.insert("x-attempts".to_string(), attempts.to_string());

        match self
            .bus
            .publish_with_headers(dlq, &record.key, record.payload.clone(), headers)
            .await
        {
            Ok(meta) => {
                error!(
                    topic = %record.topic,
                    group = %self.spec.group,
                    partition = record.partition,
                    offset = record.offset,
                    dlq = %dlq,
                    dlq_offset = meta.offset,
                    attempts,
                    "{error}, moved to dead-letter topic"
                );
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(group = %self.spec.group, "could not dead-letter record: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyHandler {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    #[async_trait]
    impl RecordHandler for FlakyHandler {
        async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
            // ---
            if record.payload == "poison" {
                return Err(HandlerError::Poison("unparsable".into()));
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(HandlerError::Transient("db down".into()));
            }
            Ok(())
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(5),
        }
    }

    async fn wait_for_lag_zero(bus: &EventBus, topic: &str, group: &str) {
        for _ in 0..500 {
            if bus.subscribe(topic, group).lag() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("group {group} never caught up on {topic}");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        // ---
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_success() {
        // ---
        let bus = EventBus::new(1, 100);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures_before_success: 2,
        });
        let cancel = CancellationToken::new();
        let spec = ConsumerSpec::new("in", "g").dead_letter("in-dlq").retry(fast_retry(3));
        let running = spawn_consumer(&bus, spec, handler.clone(), cancel.clone());

        bus.publish("in", "k", "ok".into()).await.unwrap();
        wait_for_lag_zero(&bus, "in", "g").await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(running.stats.processed(), 1);
        assert_eq!(running.stats.retried(), 2);
        assert_eq!(bus.len("in-dlq"), 0);

        cancel.cancel();
        running.join().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter_with_origin_headers() {
        // ---
        let bus = EventBus::new(1, 100);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
        });
        let cancel = CancellationToken::new();
        let spec = ConsumerSpec::new("in", "g").dead_letter("in-dlq").retry(fast_retry(3));
        let running = spawn_consumer(&bus, spec, handler.clone(), cancel.clone());

        bus.publish("in", "k", "payload".into()).await.unwrap();
        wait_for_lag_zero(&bus, "in", "g").await;

        // First attempt plus three redeliveries
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let dead = bus.read("in-dlq", 10);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "payload");
        assert_eq!(dead[0].headers["x-original-topic"], "in");
        assert_eq!(dead[0].headers["x-consumer-group"], "g");
        assert_eq!(dead[0].headers["x-attempts"], "4");

        cancel.cancel();
        running.join().await;
    }

    #[tokio::test]
    async fn test_poison_record_is_dead_lettered_without_retry() {
        // ---
        let bus = EventBus::new(1, 100);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
        });
        let cancel = CancellationToken::new();
        let spec = ConsumerSpec::new("in", "g").dead_letter("in-dlq").retry(fast_retry(3));
        let running = spawn_consumer(&bus, spec, handler.clone(), cancel.clone());

        bus.publish("in", "k", "poison".into()).await.unwrap();
        bus.publish("in", "k", "fine".into()).await.unwrap();
        wait_for_lag_zero(&bus, "in", "g").await;

        assert_eq!(running.stats.retried(), 0);
        assert_eq!(running.stats.dead_lettered(), 1);
        assert_eq!(running.stats.processed(), 1);
        assert_eq!(bus.read("in-dlq", 10)[0].headers["x-attempts"], "1");

        cancel.cancel();
        running.join().await;
    }

    #[tokio::test]
    async fn test_failure_without_dead_letter_topic_is_dropped() {
        // ---
        let bus = EventBus::new(1, 100);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
        });
        let cancel = CancellationToken::new();
        let spec = ConsumerSpec::new("in", "g").retry(fast_retry(0));
        let running = spawn_consumer(&bus, spec, handler, cancel.clone());

        bus.publish("in", "k", "poison".into()).await.unwrap();
        wait_for_lag_zero(&bus, "in", "g").await;

        assert_eq!(running.stats.dropped(), 1);
        cancel.cancel();
        running.join().await;
    }
}
