//! Records, produce promises, and the per-partition record buffer.
//!
//! Every partition the client produces to owns one [`RecordBuffer`]. The
//! buffer queues batches of promised records until the partition leader's
//! sink drains them. The buffer object survives metadata merges: a leader
//! change re-registers the same buffer with the new leader's sink, so no
//! queued record is ever dropped by a refresh.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::broker::Sink;
use crate::constants::{INDEX_UNREGISTERED, OFFSET_UNSET};
use crate::error::{Error, Result};

/// A record to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    /// A value-only record.
    pub fn from_value(value: impl Into<Bytes>) -> Record {
        Record {
            key: None,
            value: value.into(),
        }
    }
}

/// Resolves with the record's assigned offset once acknowledged, or the
/// error that failed it.
pub type ProducePromise = oneshot::Receiver<Result<i64>>;

struct PromisedRecord {
    record: Record,
    promise: oneshot::Sender<Result<i64>>,
}

impl PromisedRecord {
    fn finish(self, res: Result<i64>) {
        // receiver may be gone; a dropped promise is not an error
        let _ = self.promise.send(res);
    }
}

/// One drainable batch of promised records.
struct Batch {
    records: Vec<PromisedRecord>,
    tries: u32,
}

struct BufferInner {
    batches: VecDeque<Batch>,
    open: bool,
    sink: Weak<Sink>,
    sink_index: i32,
    last_acked_offset: i64,
    failing: bool,
    added_to_txn: bool,
}

/// Producer queue for one partition.
pub struct RecordBuffer {
    topic: String,
    partition: i32,
    linger: Duration,
    retry_limit: u32,
    inner: Mutex<BufferInner>,
}

impl RecordBuffer {
    pub fn new(topic: &str, partition: i32, linger: Duration, retry_limit: u32) -> RecordBuffer {
        RecordBuffer {
            topic: topic.to_string(),
            partition,
            linger,
            retry_limit,
            inner: Mutex::new(BufferInner {
                batches: VecDeque::new(),
                open: false,
                sink: Weak::new(),
                sink_index: INDEX_UNREGISTERED,
                last_acked_offset: OFFSET_UNSET,
                failing: false,
                added_to_txn: false,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Queue a record into the newest open batch, starting one if needed.
    pub fn push(&self, record: Record) -> ProducePromise {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            inner.batches.push_back(Batch {
                records: Vec::new(),
                tries: 0,
            });
            inner.open = true;
        }
        if let Some(back) = inner.batches.back_mut() {
            back.records.push(PromisedRecord {
                record,
                promise: tx,
            });
        }
        rx
    }

    /// Seal the open batch; the next push starts a fresh one. The sink
    /// calls this when it takes a batch to drain.
    pub fn seal_batch(&self) {
        self.inner.lock().unwrap().open = false;
    }

    /// Number of records queued across all batches.
    pub fn buffered_records(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .batches
            .iter()
            .map(|b| b.records.len())
            .sum()
    }

    /// Acknowledge the first batch at `base_offset`, resolving each record
    /// promise with its assigned offset. The sink calls this as produce
    /// responses arrive.
    pub fn ack_batch0(&self, base_offset: i64) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.batches.len() == 1 {
                inner.open = false;
            }
            inner.batches.pop_front()
        };
        let Some(batch) = batch else { return };
        let bytes: usize = batch
            .records
            .iter()
            .map(|pr| pr.record.value.len() + pr.record.key.as_ref().map_or(0, |k| k.len()))
            .sum();
        let count = batch.records.len() as i64;
        for (i, pr) in batch.records.into_iter().enumerate() {
            pr.finish(Ok(base_offset + i as i64));
        }
        if count > 0 {
            self.set_last_acked_offset(base_offset + count - 1);
        }
        debug!(
            topic = %self.topic,
            partition = self.partition,
            records = count,
            bytes,
            base_offset,
            "acknowledged batch"
        );
    }

    /// Bump the first batch's try count, failing the batch's records with
    /// `err` if it exhausted its retries.
    pub fn bump_tries_and_maybe_fail_batch0(&self, err: &Error) {
        let failed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(first) = inner.batches.front_mut() else {
                return;
            };
            first.tries += 1;
            if first.tries <= self.retry_limit {
                return;
            }
            if inner.batches.len() == 1 {
                inner.open = false;
            }
            inner.batches.pop_front()
        };
        if let Some(batch) = failed {
            debug!(
                topic = %self.topic,
                partition = self.partition,
                records = batch.records.len(),
                %err,
                "batch exhausted retries, failing records"
            );
            for pr in batch.records {
                pr.finish(Err(err.clone()));
            }
        }
    }

    /// Fail every queued record with `err`.
    pub fn fail_all_records(&self, err: Error) {
        let drained: Vec<Batch> = {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
            inner.batches.drain(..).collect()
        };
        for batch in drained {
            for pr in batch.records {
                pr.finish(Err(err.clone()));
            }
        }
    }

    /// Mark the buffer as failing; its sink stops draining it until a
    /// metadata merge clears the flag.
    pub fn set_failing(&self) {
        self.inner.lock().unwrap().failing = true;
    }

    pub fn clear_failing(&self) {
        self.inner.lock().unwrap().failing = false;
    }

    pub fn is_failing(&self) -> bool {
        self.inner.lock().unwrap().failing
    }

    /// The sink currently draining this buffer.
    pub fn sink(&self) -> Option<Arc<Sink>> {
        self.inner.lock().unwrap().sink.upgrade()
    }

    pub(crate) fn set_sink(&self, sink: &Arc<Sink>) {
        self.inner.lock().unwrap().sink = Arc::downgrade(sink);
    }

    pub(crate) fn sink_index(&self) -> i32 {
        self.inner.lock().unwrap().sink_index
    }

    pub(crate) fn set_sink_index(&self, index: i32) {
        self.inner.lock().unwrap().sink_index = index;
    }

    /// Whether the buffer is registered with a sink.
    pub fn is_registered(&self) -> bool {
        self.sink_index() != INDEX_UNREGISTERED
    }

    pub fn last_acked_offset(&self) -> i64 {
        self.inner.lock().unwrap().last_acked_offset
    }

    /// Record the highest acknowledged offset; the sink calls this as
    /// produce responses arrive.
    pub fn set_last_acked_offset(&self, offset: i64) {
        self.inner.lock().unwrap().last_acked_offset = offset;
    }

    /// Note that a produce request added this partition to the current
    /// transaction.
    pub fn mark_added_to_txn(&self) {
        self.inner.lock().unwrap().added_to_txn = true;
    }

    /// Clear and return the added-to-txn flag. EndTxn drains this to learn
    /// whether the transaction touched any partition at all.
    pub(crate) fn take_added_to_txn(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.added_to_txn)
    }
}

impl std::fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("RecordBuffer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("batches", &inner.batches.len())
            .field("sink_index", &inner.sink_index)
            .field("last_acked_offset", &inner.last_acked_offset)
            .field("failing", &inner.failing)
            .finish()
    }
}
