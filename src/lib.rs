//! # Kavka
//! Client-side coordination core for the Kafka protocol.
//!
//! This crate implements the machinery that makes a Kafka client correct
//! under concurrency and failure, independent of any particular wire or
//! connection layer:
//!
//! - A **metadata refresh loop** that discovers topics, partitions, and
//!   leaders, coalescing triggers and backing off on failure.
//! - A **topic snapshot merge** that reconciles fresh metadata with
//!   in-flight producer buffers and consumer cursors, migrating them
//!   between broker sinks and sources without losing records or position.
//! - A **group transact session** for consume-modify-produce exactly-once
//!   pipelines, interlocking rebalance callbacks with the transaction
//!   commit/abort decision.
//!
//! # Goals
//! - Correctness first: rebalances abort transactions, snapshots are
//!   never torn, leader epochs never regress
//! - Lock-free hot paths: produce and consume read topic state through
//!   atomic snapshot pointers
//! - Pluggable edges: the wire lives behind small async traits, so the
//!   core runs identically against a connection pool or a test broker
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use kavka::client::{
//!     Client, ClientConfig, Collaborators, MetadataFetcher, MetadataResponse,
//! };
//! use kavka::error::Result;
//! use tokio_util::sync::CancellationToken;
//!
//! struct MyFetcher;
//!
//! #[async_trait]
//! impl MetadataFetcher for MyFetcher {
//!     async fn fetch_metadata(
//!         &self,
//!         _all_topics: bool,
//!         _topics: &[String],
//!     ) -> Result<MetadataResponse> {
//!         // decode a Metadata response from your connection layer
//!         Ok(MetadataResponse::default())
//!     }
//! }
//!
//! struct MyDriver;
//!
//! #[async_trait]
//! impl kavka::client::ProducerDriver for MyDriver {
//!     async fn flush(&self, _ctx: &CancellationToken) -> Result<()> {
//!         Ok(())
//!     }
//!     async fn abort_buffered_records(&self, _ctx: &CancellationToken) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyTxnBroker;
//!
//! #[async_trait]
//! impl kavka::client::TxnBroker for MyTxnBroker {
//!     async fn init_producer_id(
//!         &self,
//!         _req: kavka::client::InitProducerIdRequest,
//!     ) -> Result<kavka::client::InitProducerIdResponse> {
//!         Ok(Default::default())
//!     }
//!     async fn add_offsets_to_txn(
//!         &self,
//!         _req: kavka::client::AddOffsetsToTxnRequest,
//!     ) -> Result<i16> {
//!         Ok(0)
//!     }
//!     async fn txn_offset_commit(
//!         &self,
//!         _req: kavka::client::TxnOffsetCommitRequest,
//!         _ctx: &CancellationToken,
//!     ) -> Result<kavka::client::TxnOffsetCommitResponse> {
//!         Ok(Default::default())
//!     }
//!     async fn end_txn(&self, _req: kavka::client::EndTxnRequest) -> Result<i16> {
//!         Ok(0)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::new(
//!         ClientConfig::default(),
//!         Collaborators {
//!             fetcher: Arc::new(MyFetcher),
//!             producer: Arc::new(MyDriver),
//!             txn: Arc::new(MyTxnBroker),
//!             group: None,
//!         },
//!     )?;
//!
//!     client.track_topics(["events"]);
//!     client
//!         .wait_metadata(&CancellationToken::new(), Duration::from_secs(5))
//!         .await;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [KIP-447: producer scalability for exactly once semantics](https://cwiki.apache.org/confluence/x/vhYlBg)

pub mod client;
pub mod constants;
pub mod error;
pub mod telemetry;

/// Commonly used types.
pub mod prelude {
    pub use crate::client::{
        Client, ClientConfig, Collaborators, EpochOffset, GroupConsumer, GroupTransactSession,
        MetadataFetcher, MetadataResponse, OffsetMap, ProducerDriver, Record, TransactionEnd,
        TxnBroker,
    };
    pub use crate::error::{Error, KafkaCode, Result};
}
