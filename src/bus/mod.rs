//! In-process event bus: append-only, partitioned, ordered logs with
//! consumer-group cursors.
//!
//! Each topic is split into partitions; a record's partition is chosen by
//! hashing its key, so records sharing a key stay in publication order.
//! Every consumer group owns one committed offset per partition and reads the
//! full log independently of every other group. A record is only considered
//! consumed once its group commits past it, which gives at-least-once
//! delivery: a consumer that stops before committing sees the record again.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::PipelineError;

mod consumer;

pub use consumer::{
    spawn_consumer, ConsumerHandle, ConsumerSpec, ConsumerStats, RecordHandler, RetryPolicy,
};

// ---

pub const READING_EVENTS: &str = "reading-events";
pub const ALARM_EVENTS: &str = "alarm-events";
pub const READING_DLQ: &str = "reading-events-dlq";
pub const ALARM_DLQ: &str = "alarm-events-dlq";

/// One entry of a topic log.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordMeta {
    pub partition: u32,
    pub offset: u64,
}

struct PartitionLog {
    /// Offset of the oldest retained record.
    base: u64,
    records: VecDeque<Arc<Record>>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<Arc<Record>> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(index as usize).cloned()
    }
}

struct Partition {
    log: RwLock<PartitionLog>,
    notify: Notify,
}

struct Topic {
    name: String,
    partitions: Vec<Partition>,
}

impl Topic {
    fn new(name: &str, partitions: u32) -> Self {
        // ---
        let partitions = (0..partitions.max(1))
            .map(|_| Partition {
                log: RwLock::new(PartitionLog {
                    base: 0,
                    records: VecDeque::new(),
                }),
                notify: Notify::new(),
            })
            .collect();
        Self {
            name: name.to_string(),
            partitions,
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }
}

/// Committed offsets of one consumer group on one topic.
struct GroupCursors {
    committed: Vec<AtomicU64>,
    /// Records passed over because retention dropped them first.
    skipped: AtomicU64,
}

struct BusInner {
    default_partitions: u32,
    retention: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    cursors: DashMap<(String, String), Arc<GroupCursors>>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    // ---
    /// `partitions` applies to topics created implicitly by `publish`;
    /// `retention` caps each partition, dropping the oldest records first.
    pub fn new(partitions: u32, retention: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                default_partitions: partitions.max(1),
                retention: retention.max(1),
                topics: RwLock::new(HashMap::new()),
                cursors: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create `name` with `partitions` partitions. Existing topics are kept.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        // ---
        let mut topics = self.inner.topics.write();
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, partitions)));
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        // ---
        if let Some(topic) = self.inner.topics.read().get(name) {
            return topic.clone();
        }
        let mut topics = self.inner.topics.write();
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.inner.default_partitions)))
            .clone()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: String,
    ) -> Result<RecordMeta, PipelineError> {
        self.publish_with_headers(topic, key, payload, BTreeMap::new())
            .await
    }

    /// Append a record to `topic`, waking every consumer parked on its
    /// partition. Fails only once the bus is closed.
    pub async fn publish_with_headers(
        &self,
        topic: &str,
        key: &str,
        payload: String,
        headers: BTreeMap<String, String>,
    ) -> Result<RecordMeta, PipelineError> {
        // ---
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Bus(format!(
                "bus is closed, cannot publish to '{topic}'"
            )));
        }

        let topic = self.topic(topic);
        let partition_id = topic.partition_for(key);
        let partition = &topic.partitions[partition_id as usize];

        let offset = {
            let mut log = partition.log.write();
            let offset = log.next_offset();
            log.records.push_back(Arc::new(Record {
                topic: topic.name.clone(),
                partition: partition_id,
                offset,
                key: key.to_string(),
                payload,
                headers,
                published_at: Utc::now(),
            }));
            while log.records.len() > self.inner.retention {
                log.records.pop_front();
                log.base += 1;
            }
            offset
        };
        partition.notify.notify_waiters();

        debug!(topic = %topic.name, partition = partition_id, offset, key, "published");
        Ok(RecordMeta {
            partition: partition_id,
            offset,
        })
    }

    /// Attach to `topic` as consumer group `group`. A new group starts from
    /// the earliest retained record; an existing group resumes from its
    /// committed offsets.
    pub fn subscribe(&self, topic: &str, group: &str) -> ConsumerGroup {
        // ---
        let topic = self.topic(topic);
        let cursors = self
            .inner
            .cursors
            .entry((topic.name.clone(), group.to_string()))
            .or_insert_with(|| {
                Arc::new(GroupCursors {
                    committed: topic
                        .partitions
                        .iter()
                        .map(|p| AtomicU64::new(p.log.read().base))
                        .collect(),
                    skipped: AtomicU64::new(0),
                })
            })
            .clone();

        ConsumerGroup {
            bus: self.inner.clone(),
            topic,
            group: group.to_string(),
            cursors,
        }
    }

    /// Newest `limit` records of `topic` across all partitions, oldest first.
    pub fn read(&self, topic: &str, limit: usize) -> Vec<Record> {
        // ---
        let Some(topic) = self.inner.topics.read().get(topic).cloned() else {
            return Vec::new();
        };

        let mut records: Vec<Record> = topic
            .partitions
            .iter()
            .flat_map(|p| {
                let log = p.log.read();
                let skip = log.records.len().saturating_sub(limit);
                log.records
                    .iter()
                    .skip(skip)
                    .map(|r| r.as_ref().clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        records.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then(a.partition.cmp(&b.partition))
                .then(a.offset.cmp(&b.offset))
        });
        let skip = records.len().saturating_sub(limit);
        records.split_off(skip)
    }

    /// Total number of records retained on `topic`.
    pub fn len(&self, topic: &str) -> u64 {
        // ---
        let Some(topic) = self.inner.topics.read().get(topic).cloned() else {
            return 0;
        };
        topic
            .partitions
            .iter()
            .map(|p| p.log.read().records.len() as u64)
            .sum()
    }

    /// Uncommitted records per `(topic, group)`, sorted by name.
    pub fn lag(&self) -> Vec<(String, String, u64)> {
        // ---
        // Snapshot the keys first; subscribe() takes the same shard locks
        let keys: Vec<(String, String)> = self
            .inner
            .cursors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut out: Vec<(String, String, u64)> = keys
            .into_iter()
            .map(|(topic, group)| {
                let lag = self.subscribe(&topic, &group).lag();
                (topic, group, lag)
            })
            .collect();
        out.sort();
        out
    }

    /// Refuse further publishes and release every parked consumer.
    pub fn close(&self) {
        // ---
        self.inner.closed.store(true, Ordering::Release);
        for topic in self.inner.topics.read().values() {
            for partition in &topic.partitions {
                partition.notify.notify_waiters();
            }
        }
    }
}

/// One consumer group's view of a topic.
#[derive(Clone)]
pub struct ConsumerGroup {
    bus: Arc<BusInner>,
    topic: Arc<Topic>,
    group: String,
    cursors: Arc<GroupCursors>,
}

impl ConsumerGroup {
    // ---
    pub fn partitions(&self) -> u32 {
        self.topic.partitions.len() as u32
    }

    /// The record at the committed position, if one has been published.
    /// Does not advance the cursor.
    pub fn poll(&self, partition: u32) -> Option<Arc<Record>> {
        // ---
        let cursor = &self.cursors.committed[partition as usize];
        let log = self.topic.partitions[partition as usize].log.read();
        let position = cursor.load(Ordering::Acquire);

        if position < log.base {
            // Only the poller that moves the cursor counts the gap
            match cursor.compare_exchange(position, log.base, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    let skipped = log.base - position;
                    self.cursors.skipped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(
                        topic = %self.topic.name,
                        group = %self.group,
                        partition,
                        skipped,
                        "consumer fell behind retention, skipping to oldest retained record"
                    );
                }
                Err(current) => return log.get(current.max(log.base)),
            }
            return log.get(log.base);
        }
        log.get(position)
    }

    /// Wait for the record at the committed position of `partition`.
    /// Returns `None` when `cancel` fires or the bus is closed.
    pub async fn next(&self, partition: u32, cancel: &CancellationToken) -> Option<Arc<Record>> {
        // ---
        let notify = &self.topic.partitions[partition as usize].notify;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() || self.bus.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(record) = self.poll(partition) {
                return Some(record);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Mark everything before `next_offset` on `partition` as consumed.
    /// Commits never move the cursor backwards.
    pub fn commit(&self, partition: u32, next_offset: u64) {
        self.cursors.committed[partition as usize].fetch_max(next_offset, Ordering::AcqRel);
    }

    /// Total records this group lost to retention across all partitions.
    pub fn skipped(&self) -> u64 {
        self.cursors.skipped.load(Ordering::Relaxed)
    }

    /// Retained records this group has not committed yet.
    pub fn lag(&self) -> u64 {
        // ---
        self.topic
            .partitions
            .iter()
            .zip(&self.cursors.committed)
            .map(|(partition, cursor)| {
                let log = partition.log.read();
                let position = cursor.load(Ordering::Acquire).max(log.base);
                log.next_offset().saturating_sub(position)
            })
            .sum()
    }
}
