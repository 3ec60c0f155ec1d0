//! The coordination core: topic snapshots, the metadata refresh loop, and
//! group transactions.
//!
//! # Architecture
//!
//! ```text
//!   triggers / ticker                rebalance callbacks
//!         │                                  │
//!         ▼                                  ▼
//!   ┌───────────────┐   fetch   ┌─────────────────────────┐
//!   │ metadata loop │──────────▶│   GroupTransactSession  │
//!   └──────┬────────┘           │  begin / end interlock  │
//!          │ merge              └───────────┬─────────────┘
//!          ▼                                │ commit + EndTxn
//!   ┌───────────────┐                       ▼
//!   │ topic snapshot│              ┌────────────────┐
//!   │  (lock-free)  │              │   TxnBroker    │
//!   └──────┬────────┘              └────────────────┘
//!          │ migrate buffers / cursors
//!          ▼
//!   ┌───────────────┐
//!   │ Sinks/Sources │  per broker
//!   └───────────────┘
//! ```
//!
//! The wire itself lives behind the traits in [`traits`].

mod broker;
mod config;
mod core;
mod cursor;
mod metadata;
mod producer;
mod record;
mod topics;
mod traits;
mod txn;


pub use broker::{BrokerHandle, Sink, Source};
pub use config::{
    default_retry_backoff, ClientConfig, RebalanceCallback, RebalanceMap, RetryBackoffFn,
};
pub use self::core::{Client, Collaborators};
pub use cursor::ConsumptionCursor;
pub use producer::ProducerId;
pub use record::{ProducePromise, Record, RecordBuffer};
pub use topics::{PartitionEntry, TopicData, TopicMap, TopicPartitions};
pub use traits::{
    AddOffsetsToTxnRequest, EndTxnRequest, EpochOffset, GroupConsumer, HeartbeatReply,
    InitProducerIdRequest, InitProducerIdResponse, MetadataBroker, MetadataFetcher,
    MetadataPartition, MetadataResponse, MetadataTopic, OffsetMap, ProducerDriver, TxnBroker,
    TxnOffsetCommitReqPartition, TxnOffsetCommitReqTopic, TxnOffsetCommitRequest,
    TxnOffsetCommitRespPartition, TxnOffsetCommitRespTopic, TxnOffsetCommitResponse,
};
pub use txn::{GroupTransactSession, TransactionEnd};
