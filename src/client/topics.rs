//! Topic and partition snapshots, and the metadata merge.
//!
//! Produce and consume hot paths read topic state lock-free: the client
//! holds an atomic pointer to an immutable map of topic name to
//! [`TopicPartitions`], and each topic holds an atomic pointer to an
//! immutable [`TopicData`]. Writers serialize on a mutex and publish whole
//! replacement values; a published snapshot is never mutated.
//!
//! [`merge_topic_partitions`] reconciles freshly fetched metadata with the
//! existing state for one topic. The merge preserves the partition's
//! record buffer and consumption cursor objects in every case: same leader
//! keeps them in place, a leader change migrates them to the new leader's
//! sink and source, and only a partition that vanished from the cluster
//! fails its buffered records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use super::cursor::{ConsumerState, ConsumptionCursor};
use super::record::RecordBuffer;
use crate::error::Error;

/// State of one partition: load status, leadership, and the owned
/// producer-side and consumer-side queues.
#[derive(Clone)]
pub struct PartitionEntry {
    /// Load error from the most recent metadata, if any.
    pub load_err: Option<Error>,
    /// Leader broker id.
    pub leader: i32,
    /// Leader epoch, -1 when the broker does not supply one.
    pub leader_epoch: i32,
    /// Producer queue for this partition.
    pub records: Arc<RecordBuffer>,
    /// Consumer position for this partition.
    pub cursor: Arc<ConsumptionCursor>,
}

impl std::fmt::Debug for PartitionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionEntry")
            .field("load_err", &self.load_err)
            .field("leader", &self.leader)
            .field("leader_epoch", &self.leader_epoch)
            .finish_non_exhaustive()
    }
}

/// Immutable per-topic state.
#[derive(Debug, Clone, Default)]
pub struct TopicData {
    /// Terminal load error for the whole topic, if any.
    pub load_err: Option<Error>,
    /// Whether the broker marks the topic internal.
    pub is_internal: bool,
    /// All known partition ids, in the order the broker returned them.
    pub partitions: Vec<i32>,
    /// The subset of partition ids currently writable.
    pub writable_partitions: Vec<i32>,
    /// All partitions by id.
    pub all: HashMap<i32, Arc<PartitionEntry>>,
    /// Writable partitions by id; the entries are shared with `all`.
    pub writable: HashMap<i32, Arc<PartitionEntry>>,
}

/// A topic's state behind an atomic pointer. Readers load, writers
/// publish replacements.
pub struct TopicPartitions {
    topic: String,
    data: ArcSwap<TopicData>,
}

impl TopicPartitions {
    /// A newly tracked topic with no metadata yet. Its partition maps are
    /// empty until the first refresh lands; downstream code tolerates
    /// that.
    pub fn new(topic: &str) -> TopicPartitions {
        TopicPartitions {
            topic: topic.to_string(),
            data: ArcSwap::from_pointee(TopicData::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Lock-free load of the current state.
    pub fn load(&self) -> Arc<TopicData> {
        self.data.load_full()
    }

    /// Publish a replacement state. `had_partitions` distinguishes the
    /// first metadata for this topic from an update.
    pub(crate) fn store_update(&self, data: TopicData, had_partitions: bool) {
        debug!(
            topic = %self.topic,
            partitions = data.partitions.len(),
            writable = data.writable_partitions.len(),
            first_load = !had_partitions,
            "publishing topic partitions"
        );
        self.data.store(Arc::new(data));
    }
}

/// Freshly fetched, not yet published state for one topic. Entries are
/// plain values here; the merge finalizes them into shared snapshots.
#[derive(Default)]
pub(crate) struct NewTopicData {
    pub load_err: Option<Error>,
    pub is_internal: bool,
    pub partitions: Vec<i32>,
    pub writable_partitions: Vec<i32>,
    pub entries: HashMap<i32, PartitionEntry>,
}

/// The client's topic map: an atomic pointer to an immutable map, with a
/// mutex serializing writers only.
#[derive(Default)]
pub struct TopicMap {
    inner: ArcSwap<HashMap<String, Arc<TopicPartitions>>>,
    mu: Mutex<()>,
}

impl TopicMap {
    /// Lock-free load of the current topic map.
    pub fn load(&self) -> Arc<HashMap<String, Arc<TopicPartitions>>> {
        self.inner.load_full()
    }

    pub fn get(&self, topic: &str) -> Option<Arc<TopicPartitions>> {
        self.inner.load().get(topic).cloned()
    }

    /// Names of every tracked topic.
    pub fn tracked(&self) -> Vec<String> {
        self.inner.load().keys().cloned().collect()
    }

    /// Begin tracking `names`, inserting empty placeholder states for the
    /// ones not yet present. Returns whether anything new was added.
    pub fn ensure_topics<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<S> = names.into_iter().collect();
        {
            let current = self.inner.load();
            if names.iter().all(|n| current.contains_key(n.as_ref())) {
                return false;
            }
        }

        let _guard = self.mu.lock().unwrap();
        let current = self.inner.load_full();
        let mut added = false;
        let mut next: HashMap<String, Arc<TopicPartitions>> = (*current).clone();
        for name in &names {
            let name = name.as_ref();
            if !next.contains_key(name) {
                next.insert(name.to_string(), Arc::new(TopicPartitions::new(name)));
                added = true;
            }
        }
        if added {
            self.inner.store(Arc::new(next));
        }
        added
    }
}

/// Merge freshly fetched metadata for one topic into its current state and
/// publish the result. Returns whether the refresh that produced `fresh`
/// needs to be retried.
///
/// Retries are needed when the topic or any partition carries a retriable
/// load error.
pub(crate) fn merge_topic_partitions(
    tp: &TopicPartitions,
    mut fresh: NewTopicData,
    consumer: &ConsumerState,
) -> bool {
    let old = tp.load();
    let had_partitions = !old.all.is_empty();

    if let Some(err) = fresh.load_err.clone() {
        // The whole topic failed to load. Keep the existing partitions,
        // adopt the error, and either schedule a retry or fail
        // everything buffered depending on the error class.
        let retriable = err.is_retriable();
        if retriable {
            for entry in old.all.values() {
                entry.records.bump_tries_and_maybe_fail_batch0(&err);
            }
        } else {
            warn!(topic = tp.topic(), %err, "topic failed to load, failing buffered records");
            for entry in old.all.values() {
                entry.records.fail_all_records(err.clone());
            }
        }
        tp.store_update(
            TopicData {
                load_err: Some(err),
                is_internal: fresh.is_internal,
                partitions: old.partitions.clone(),
                writable_partitions: old.writable_partitions.clone(),
                all: old.all.clone(),
                writable: old.writable.clone(),
            },
            had_partitions,
        );
        return retriable;
    }

    let mut needs_retry = false;
    let mut merged = std::mem::take(&mut fresh.entries);

    // Partitions only the broker forgot are rare: either the metadata came
    // from a stale broker, or the topic was deleted and recreated with
    // fewer partitions. Collected here, cleaned up after publication.
    let mut deleted: Vec<Arc<PartitionEntry>> = Vec::new();

    for (part, old_entry) in &old.all {
        let Some(new_entry) = merged.get_mut(part) else {
            deleted.push(Arc::clone(old_entry));
            continue;
        };

        if let Some(err) = new_entry.load_err.clone() {
            // Partition errors are usually transient. Keep the old entry
            // wholesale under the new error so the buffer and cursor
            // survive, and try again.
            *new_entry = (**old_entry).clone();
            new_entry.load_err = Some(err.clone());
            new_entry.records.bump_tries_and_maybe_fail_batch0(&err);
            needs_retry = true;
            continue;
        }

        if new_entry.leader_epoch < old_entry.leader_epoch {
            // Stale metadata; leadership never goes backwards.
            debug!(
                topic = tp.topic(),
                partition = part,
                old_epoch = old_entry.leader_epoch,
                new_epoch = new_entry.leader_epoch,
                "ignoring metadata with older leader epoch"
            );
            *new_entry = (**old_entry).clone();
            continue;
        }

        let same_sink = match (new_entry.records.sink(), old_entry.records.sink()) {
            (Some(new_sink), Some(old_sink)) => Arc::ptr_eq(&new_sink, &old_sink),
            _ => false,
        };
        if same_sink {
            new_entry.records = Arc::clone(&old_entry.records);
            new_entry.cursor = Arc::clone(&old_entry.cursor);
        } else {
            migrate_production(old_entry, new_entry);
            migrate_consumption(old_entry, new_entry);
        }
        new_entry.records.clear_failing();
        new_entry.cursor.clear_failing();
    }

    // Anything still unregistered is a brand-new partition; hook its
    // buffer and cursor up to the leader's pumps. Partitions with a load
    // error have nothing to register against yet.
    for entry in merged.values() {
        if entry.load_err.is_some() {
            continue;
        }
        if !entry.records.is_registered() {
            if let Some(sink) = entry.records.sink() {
                sink.add_source(&entry.records);
            }
        }
        if !entry.cursor.is_registered() {
            if let Some(source) = entry.cursor.source() {
                source.add_consumption(&entry.cursor);
            }
        }
    }

    let all: HashMap<i32, Arc<PartitionEntry>> = merged
        .into_iter()
        .map(|(part, entry)| (part, Arc::new(entry)))
        .collect();
    let writable: HashMap<i32, Arc<PartitionEntry>> = fresh
        .writable_partitions
        .iter()
        .filter_map(|part| {
            all.get(part)
                .filter(|entry| entry.load_err.is_none())
                .map(|entry| (*part, Arc::clone(entry)))
        })
        .collect();
    let writable_partitions: Vec<i32> = fresh
        .writable_partitions
        .iter()
        .copied()
        .filter(|part| writable.contains_key(part))
        .collect();

    tp.store_update(
        TopicData {
            load_err: None,
            is_internal: fresh.is_internal,
            partitions: fresh.partitions,
            writable_partitions,
            all,
            writable,
        },
        had_partitions,
    );

    if !deleted.is_empty() {
        info!(
            topic = tp.topic(),
            partitions = deleted.len(),
            "partitions disappeared from metadata, failing their records"
        );
        handle_deleted_partitions(&deleted, consumer);
    }

    needs_retry
}

/// Move the old entry's record buffer onto the new leader's sink. The
/// buffer object and its queued batches are preserved.
fn migrate_production(old: &Arc<PartitionEntry>, new: &mut PartitionEntry) {
    if let Some(old_sink) = old.records.sink() {
        old_sink.remove_source(&old.records);
    }
    if let Some(new_sink) = new.records.sink() {
        old.records.set_sink(&new_sink);
        new_sink.add_source(&old.records);
    }
    new.records = Arc::clone(&old.records);
}

/// Move the old entry's cursor onto the new leader's source, carrying the
/// consumption position forward under the new leader epoch.
fn migrate_consumption(old: &Arc<PartitionEntry>, new: &mut PartitionEntry) {
    if let Some(old_source) = old.cursor.source() {
        old_source.remove_consumption(&old.cursor);
    }
    if let Some(new_source) = new.cursor.source() {
        old.cursor.set_source(&new_source);
        new_source.add_consumption(&old.cursor);
    }
    old.cursor.set_current_leader_epoch(new.leader_epoch);
    new.cursor = Arc::clone(&old.cursor);
}

/// Unregister deleted partitions from their pumps, fail everything
/// buffered for them, and clear consumer state.
fn handle_deleted_partitions(deleted: &[Arc<PartitionEntry>], consumer: &ConsumerState) {
    for entry in deleted {
        if let Some(sink) = entry.records.sink() {
            sink.remove_source(&entry.records);
        }
        entry.records.fail_all_records(Error::PartitionDeleted);
        if let Some(source) = entry.cursor.source() {
            source.remove_consumption(&entry.cursor);
        }
        consumer.delete_partition(entry.records.topic(), entry.records.partition());
    }
}
