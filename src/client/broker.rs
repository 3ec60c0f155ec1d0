//! Per-broker sink and source registries.
//!
//! Each known broker gets one [`Sink`] (outbound record pump) and one
//! [`Source`] (inbound fetch pump). The pumps' request loops are external;
//! this module owns the registration collections the metadata merge moves
//! buffers and cursors between.
//!
//! Registration is index-keyed: a buffer remembers its position in its
//! sink's list, and removal swap-removes in O(1), fixing up the index of
//! whichever entry was displaced. The -1 sentinel means unregistered. This
//! keeps ownership with the sink and source collections, with no
//! back-pointer cycles to the partition entries.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::cursor::ConsumptionCursor;
use super::record::RecordBuffer;
use crate::constants::INDEX_UNREGISTERED;

/// Outbound record pump registry for one broker.
pub struct Sink {
    broker: i32,
    buffers: Mutex<Vec<Arc<RecordBuffer>>>,
}

impl Sink {
    pub fn new(broker: i32) -> Sink {
        Sink {
            broker,
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// The broker this sink drains to.
    pub fn broker(&self) -> i32 {
        self.broker
    }

    /// Register a buffer for draining. The buffer's sink association must
    /// already point here, and it must not be registered elsewhere.
    pub fn add_source(&self, buffer: &Arc<RecordBuffer>) {
        let mut buffers = self.buffers.lock().unwrap();
        buffer.set_sink_index(buffers.len() as i32);
        buffers.push(Arc::clone(buffer));
        debug!(
            broker = self.broker,
            topic = buffer.topic(),
            partition = buffer.partition(),
            "registered record buffer with sink"
        );
    }

    /// Unregister a buffer, swap-removing it from the list.
    pub fn remove_source(&self, buffer: &Arc<RecordBuffer>) {
        let mut buffers = self.buffers.lock().unwrap();
        let idx = buffer.sink_index();
        if idx == INDEX_UNREGISTERED {
            return;
        }
        let idx = idx as usize;
        if idx >= buffers.len() || !Arc::ptr_eq(&buffers[idx], buffer) {
            return;
        }
        buffers.swap_remove(idx);
        if let Some(displaced) = buffers.get(idx) {
            displaced.set_sink_index(idx as i32);
        }
        buffer.set_sink_index(INDEX_UNREGISTERED);
        debug!(
            broker = self.broker,
            topic = buffer.topic(),
            partition = buffer.partition(),
            "removed record buffer from sink"
        );
    }

    /// Whether the sink drains this exact buffer.
    pub fn drains(&self, buffer: &Arc<RecordBuffer>) -> bool {
        self.buffers
            .lock()
            .unwrap()
            .iter()
            .any(|b| Arc::ptr_eq(b, buffer))
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound fetch pump registry for one broker.
pub struct Source {
    broker: i32,
    cursors: Mutex<Vec<Arc<ConsumptionCursor>>>,
}

impl Source {
    pub fn new(broker: i32) -> Source {
        Source {
            broker,
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// The broker this source fetches from.
    pub fn broker(&self) -> i32 {
        self.broker
    }

    /// Register a cursor for fetching. The cursor's source association
    /// must already point here, and it must not be registered elsewhere.
    pub fn add_consumption(&self, cursor: &Arc<ConsumptionCursor>) {
        let mut cursors = self.cursors.lock().unwrap();
        cursor.set_source_index(cursors.len() as i32);
        cursors.push(Arc::clone(cursor));
        debug!(
            broker = self.broker,
            topic = cursor.topic(),
            partition = cursor.partition(),
            "registered consumption cursor with source"
        );
    }

    /// Unregister a cursor, swap-removing it from the list.
    pub fn remove_consumption(&self, cursor: &Arc<ConsumptionCursor>) {
        let mut cursors = self.cursors.lock().unwrap();
        let idx = cursor.source_index();
        if idx == INDEX_UNREGISTERED {
            return;
        }
        let idx = idx as usize;
        if idx >= cursors.len() || !Arc::ptr_eq(&cursors[idx], cursor) {
            return;
        }
        cursors.swap_remove(idx);
        if let Some(displaced) = cursors.get(idx) {
            displaced.set_source_index(idx as i32);
        }
        cursor.set_source_index(INDEX_UNREGISTERED);
        debug!(
            broker = self.broker,
            topic = cursor.topic(),
            partition = cursor.partition(),
            "removed consumption cursor from source"
        );
    }

    /// Whether the source fetches for this exact cursor.
    pub fn fetches(&self, cursor: &Arc<ConsumptionCursor>) -> bool {
        self.cursors
            .lock()
            .unwrap()
            .iter()
            .any(|c| Arc::ptr_eq(c, cursor))
    }

    /// Number of registered cursors.
    pub fn len(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One known broker: its id plus its sink and source.
#[derive(Clone)]
pub struct BrokerHandle {
    pub id: i32,
    pub sink: Arc<Sink>,
    pub source: Arc<Source>,
}

impl BrokerHandle {
    pub fn new(id: i32) -> BrokerHandle {
        BrokerHandle {
            id,
            sink: Arc::new(Sink::new(id)),
            source: Arc::new(Source::new(id)),
        }
    }
}
