use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use rdkafka::message::OwnedMessage;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// A partition paired with the offset consumption should start from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Identity of one record instance handed downstream.
///
/// Re-emitting a failed record produces a new `RecordId` for the same
/// `(partition, offset)` with the retry counter bumped; the first-emitted
/// timestamp is carried over so end-to-end latency stays measurable.
///
/// The generation identifies the partition assignment the record was emitted
/// under. After a revoke and reassign the same offset gets a new generation,
/// so signals for the old emission no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    partition: Partition,
    offset: i64,
    retry: u32,
    generation: u64,
    first_emitted_at: Instant,
}

impl RecordId {
    pub fn new(partition: Partition, offset: i64, first_emitted_at: Instant) -> Self {
        Self {
            partition,
            offset,
            retry: 0,
            generation: 0,
            first_emitted_at,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Number of times this record was re-emitted before this instance.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Number of failures this instance represents once it fails.
    pub fn failures(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn first_emitted_at(&self) -> Instant {
        self.first_emitted_at
    }

    /// Identity of the next emission attempt for the same record.
    pub fn next_attempt(&self) -> Self {
        Self {
            partition: self.partition.clone(),
            offset: self.offset,
            retry: self.retry.saturating_add(1),
            generation: self.generation,
            first_emitted_at: self.first_emitted_at,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.partition, self.offset, self.retry)
    }
}

/// Snapshot of partition -> next offset to resume from, built once per commit.
///
/// Batches are immutable once built; completions that arrive after the
/// snapshot are picked up by the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    offsets: BTreeMap<Partition, i64>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, partition: Partition, offset: i64) {
        self.offsets.insert(partition, offset);
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.offsets.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Partition, i64> {
        self.offsets.iter()
    }
}

impl FromIterator<(Partition, i64)> for CommitBatch {
    fn from_iter<I: IntoIterator<Item = (Partition, i64)>>(iter: I) -> Self {
        Self {
            offsets: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CommitBatch {
    type Item = (&'a Partition, &'a i64);
    type IntoIter = btree_map::Iter<'a, Partition, i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.offsets.iter()
    }
}

/// An owned record returned by the log client's poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledRecord {
    partition: Partition,
    offset: i64,
    key: Option<Bytes>,
    payload: Option<Bytes>,
}

impl PolledRecord {
    pub fn new(partition: Partition, offset: i64, payload: Option<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: Option<Bytes>) -> Self {
        self.key = key;
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }
}

impl From<&OwnedMessage> for PolledRecord {
    fn from(msg: &OwnedMessage) -> Self {
        Self {
            partition: Partition::new(msg.topic().to_string(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(Bytes::copy_from_slice),
            payload: msg.payload().map(Bytes::copy_from_slice),
        }
    }
}

/// Downstream completion outcome for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageResult {
    Success,
    Failed(String),
}

/// A completion signal delivered asynchronously to the driving loop.
#[derive(Debug, Clone)]
pub struct Completion {
    pub record_id: RecordId,
    pub result: MessageResult,
}
