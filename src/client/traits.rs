//! Collaborator traits at the edges of the coordination core.
//!
//! The core deliberately does not speak the wire: metadata fetching, the
//! record drain path, and the transactional RPCs are behind traits so that
//! the same coordination logic runs against a real connection pool or an
//! in-memory test broker.
//!
//! # Trait Hierarchy
//!
//! - [`MetadataFetcher`]: one call, `fetch_metadata`, feeding the refresh
//!   loop.
//! - [`ProducerDriver`]: flush and abort of buffered records, owned by the
//!   produce pump.
//! - [`TxnBroker`]: the transactional RPC quartet (InitProducerId,
//!   AddOffsetsToTxn, TxnOffsetCommit, EndTxn).
//! - [`GroupConsumer`]: group identity, offset views, and the
//!   heartbeat-force channel the transact session uses to prove liveness
//!   before ending a transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// An offset paired with the leader epoch it was consumed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochOffset {
    pub offset: i64,
    pub epoch: i32,
}

/// Topic name to partition id to offset.
pub type OffsetMap = HashMap<String, HashMap<i32, EpochOffset>>;

/// A broker as named in a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

/// One partition of a topic in a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    pub partition: i32,
    pub error_code: i16,
    pub leader: i32,
    /// Leadership term. Only meaningful when the response version is at
    /// least 7; ignored otherwise.
    pub leader_epoch: i32,
}

/// One topic in a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTopic {
    pub topic: String,
    pub error_code: i16,
    pub is_internal: bool,
    pub partitions: Vec<MetadataPartition>,
}

/// A decoded Metadata response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataResponse {
    pub version: i16,
    pub brokers: Vec<MetadataBroker>,
    pub topics: Vec<MetadataTopic>,
}

/// Fetches cluster metadata.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetch metadata for `topics`, or for every topic in the cluster when
    /// `all_topics` is set (regex subscriptions discover new matches this
    /// way).
    async fn fetch_metadata(&self, all_topics: bool, topics: &[String])
        -> Result<MetadataResponse>;
}

/// The produce pump's flush and abort surface.
#[async_trait]
pub trait ProducerDriver: Send + Sync {
    /// Wait until no records remain buffered.
    async fn flush(&self, ctx: &CancellationToken) -> Result<()>;

    /// Fail all unflushed records and wait for the backlog to clear.
    async fn abort_buffered_records(&self, ctx: &CancellationToken) -> Result<()>;
}

/// An InitProducerId request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitProducerIdRequest {
    pub transactional_id: Option<String>,
    /// Current id, or -1 when uninitialized. Set for KIP-360 epoch bumps.
    pub current_id: i64,
    pub current_epoch: i16,
}

/// An InitProducerId response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitProducerIdResponse {
    pub error_code: i16,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

/// An AddOffsetsToTxn request, tying a group's offsets topic into the
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOffsetsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub group: String,
}

/// One partition in a TxnOffsetCommit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOffsetCommitReqPartition {
    pub partition: i32,
    pub offset: i64,
    pub leader_epoch: i32,
    pub metadata: Option<String>,
}

/// One topic in a TxnOffsetCommit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOffsetCommitReqTopic {
    pub topic: String,
    pub partitions: Vec<TxnOffsetCommitReqPartition>,
}

/// A TxnOffsetCommit request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxnOffsetCommitRequest {
    pub transactional_id: String,
    pub group: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub generation: i32,
    pub member_id: String,
    pub instance_id: Option<String>,
    pub topics: Vec<TxnOffsetCommitReqTopic>,
}

/// One partition in a TxnOffsetCommit response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOffsetCommitRespPartition {
    pub partition: i32,
    pub error_code: i16,
}

/// One topic in a TxnOffsetCommit response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOffsetCommitRespTopic {
    pub topic: String,
    pub partitions: Vec<TxnOffsetCommitRespPartition>,
}

/// A TxnOffsetCommit response. A version of at least 3 signals KIP-447
/// semantics: the broker itself blocks rebalance offset fetches until the
/// transaction's markers are written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxnOffsetCommitResponse {
    pub version: i16,
    pub topics: Vec<TxnOffsetCommitRespTopic>,
}

/// An EndTxn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub commit: bool,
}

/// The transactional RPC surface.
///
/// Implementations return the wire error code for the single-code
/// responses; the core maps codes through [`crate::error::Error::from_wire`].
#[async_trait]
pub trait TxnBroker: Send + Sync {
    async fn init_producer_id(&self, req: InitProducerIdRequest) -> Result<InitProducerIdResponse>;

    async fn add_offsets_to_txn(&self, req: AddOffsetsToTxnRequest) -> Result<i16>;

    /// Issue a TxnOffsetCommit. The request is abandoned when `ctx` is
    /// cancelled.
    async fn txn_offset_commit(
        &self,
        req: TxnOffsetCommitRequest,
        ctx: &CancellationToken,
    ) -> Result<TxnOffsetCommitResponse>;

    async fn end_txn(&self, req: EndTxnRequest) -> Result<i16>;
}

/// Reply slot for a forced heartbeat: the group's heartbeat loop reports
/// the result of the next heartbeat through it.
pub type HeartbeatReply = oneshot::Sender<Result<()>>;

/// The group consumer surface the transact session coordinates with.
pub trait GroupConsumer: Send + Sync {
    /// The configured group.
    fn group(&self) -> String;

    /// The member's current generation.
    fn generation(&self) -> i32;

    /// The member id assigned by the coordinator.
    fn member_id(&self) -> String;

    /// The static instance id, if configured.
    fn instance_id(&self) -> Option<String>;

    /// Offsets most recently committed to the broker.
    fn committed_offsets(&self) -> OffsetMap;

    /// Offsets consumed but not yet committed.
    fn uncommitted_offsets(&self) -> OffsetMap;

    /// Overwrite the consumer's offsets, e.g. after a transaction ends.
    fn set_offsets(&self, offsets: OffsetMap, from_reset: bool);

    /// Channel into the group's heartbeat loop. Sending a reply slot forces
    /// a heartbeat; the loop answers through the slot.
    fn heartbeat_force(&self) -> mpsc::Sender<HeartbeatReply>;

    /// The group's lifetime: cancelled when the member leaves the group.
    fn context(&self) -> CancellationToken;
}
