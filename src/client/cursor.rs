//! Consumption cursors and the consumer-side partition state.
//!
//! A [`ConsumptionCursor`] tracks where the client is consuming within one
//! partition. Like its producer-side sibling the cursor object survives
//! metadata merges: a leader change moves the same cursor to the new
//! leader's source, so the consumption position is never reset by a
//! refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::debug;

use super::broker::Source;
use crate::constants::{EPOCH_UNSET, INDEX_UNREGISTERED, OFFSET_UNSET};

struct CursorInner {
    offset: i64,
    current_leader_epoch: i32,
    last_consumed_epoch: i32,
    source: Weak<Source>,
    source_index: i32,
    failing: bool,
}

/// Consumer offset state for one partition.
pub struct ConsumptionCursor {
    topic: String,
    partition: i32,
    inner: Mutex<CursorInner>,
}

impl ConsumptionCursor {
    pub fn new(topic: &str, partition: i32, leader_epoch: i32) -> ConsumptionCursor {
        ConsumptionCursor {
            topic: topic.to_string(),
            partition,
            inner: Mutex::new(CursorInner {
                offset: OFFSET_UNSET,
                current_leader_epoch: leader_epoch,
                last_consumed_epoch: EPOCH_UNSET,
                source: Weak::new(),
                source_index: INDEX_UNREGISTERED,
                failing: false,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The next offset to fetch, or -1 while not consuming.
    pub fn offset(&self) -> i64 {
        self.inner.lock().unwrap().offset
    }

    /// Position the cursor; the fetch path calls this when consumption
    /// starts or after an offset reset.
    pub fn set_offset(&self, offset: i64) {
        self.inner.lock().unwrap().offset = offset;
    }

    /// The newest leader epoch known for the partition.
    pub fn current_leader_epoch(&self) -> i32 {
        self.inner.lock().unwrap().current_leader_epoch
    }

    pub(crate) fn set_current_leader_epoch(&self, epoch: i32) {
        self.inner.lock().unwrap().current_leader_epoch = epoch;
    }

    /// Epoch of the most recently consumed record, -1 until one arrives.
    pub fn last_consumed_epoch(&self) -> i32 {
        self.inner.lock().unwrap().last_consumed_epoch
    }

    /// Advance past a consumed record.
    pub fn record_consumed(&self, offset: i64, epoch: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.offset = offset + 1;
        inner.last_consumed_epoch = epoch;
    }

    /// The source currently fetching for this cursor.
    pub fn source(&self) -> Option<Arc<Source>> {
        self.inner.lock().unwrap().source.upgrade()
    }

    pub(crate) fn set_source(&self, source: &Arc<Source>) {
        self.inner.lock().unwrap().source = Arc::downgrade(source);
    }

    pub(crate) fn source_index(&self) -> i32 {
        self.inner.lock().unwrap().source_index
    }

    pub(crate) fn set_source_index(&self, index: i32) {
        self.inner.lock().unwrap().source_index = index;
    }

    /// Whether the cursor is registered with a source.
    pub fn is_registered(&self) -> bool {
        self.source_index() != INDEX_UNREGISTERED
    }

    /// Mark the cursor as failing; its source skips it until a metadata
    /// merge clears the flag.
    pub fn set_failing(&self) {
        self.inner.lock().unwrap().failing = true;
    }

    pub fn clear_failing(&self) {
        self.inner.lock().unwrap().failing = false;
    }

    pub fn is_failing(&self) -> bool {
        self.inner.lock().unwrap().failing
    }
}

impl std::fmt::Debug for ConsumptionCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ConsumptionCursor")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &inner.offset)
            .field("current_leader_epoch", &inner.current_leader_epoch)
            .field("source_index", &inner.source_index)
            .field("failing", &inner.failing)
            .finish()
    }
}

/// Consumer-side bookkeeping shared by the fetch path and the metadata
/// merge.
#[derive(Default)]
pub(crate) struct ConsumerState {
    /// Notified after every metadata update so fetch sessions revalidate
    /// their assignments.
    metadata_update: Notify,
    /// Cursors the fetch path is actively using, by topic and partition.
    using: Mutex<HashMap<(String, i32), Arc<ConsumptionCursor>>>,
}

impl ConsumerState {
    /// Wake anything waiting on fresh metadata.
    pub(crate) fn do_on_metadata_update(&self) {
        self.metadata_update.notify_waiters();
    }

    /// Await the next metadata update signal.
    #[allow(dead_code)]
    pub(crate) async fn metadata_updated(&self) {
        self.metadata_update.notified().await;
    }

    /// Record that the fetch path consumes through `cursor`.
    pub(crate) fn track(&self, cursor: Arc<ConsumptionCursor>) {
        self.using.lock().unwrap().insert(
            (cursor.topic().to_string(), cursor.partition()),
            cursor,
        );
    }

    /// Drop all consumer state for a partition that no longer exists.
    pub(crate) fn delete_partition(&self, topic: &str, partition: i32) {
        let removed = self
            .using
            .lock()
            .unwrap()
            .remove(&(topic.to_string(), partition));
        if removed.is_some() {
            debug!(topic, partition, "cleared consumer state for deleted partition");
        }
    }

    pub(crate) fn is_tracking(&self, topic: &str, partition: i32) -> bool {
        self.using
            .lock()
            .unwrap()
            .contains_key(&(topic.to_string(), partition))
    }
}
