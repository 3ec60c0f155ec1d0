//! Crate and protocol level errors.
//!
//! The crate uses a two-layer error model:
//!
//! - [`KafkaCode`]: wire protocol error codes as the broker reports them,
//!   with the retriable / non-retriable split of the Kafka protocol.
//! - [`Error`]: everything this client can surface, wrapping a [`KafkaCode`]
//!   where the failure came off the wire and adding the client-local
//!   conditions (partition deletion, transactional state misuse, fatal
//!   producer IDs).
//!
//! Two groupings of codes drive control flow elsewhere and are exposed as
//! predicates here: [`KafkaCode::is_retriable`] (schedule another attempt)
//! and [`KafkaCode::is_abortable_commit`] (a transactional offset commit
//! that must flip to an abort instead of failing the session).

use std::{fmt, result};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors reported by a remote Kafka broker.
///
/// See the [Kafka protocol error table](https://kafka.apache.org/protocol.html#protocol_error_codes).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range maintained by the broker.
    OffsetOutOfRange = 1,
    /// A message failed its CRC check.
    CorruptMessage = 2,
    /// The topic or partition does not exist on this broker.
    UnknownTopicOrPartition = 3,
    /// There is no leader for this partition; it is unavailable for writes.
    LeaderNotAvailable = 5,
    /// The request was sent to a replica that is not the partition leader;
    /// the client's metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded its user-specified time limit.
    RequestTimedOut = 7,
    /// The broker is not alive.
    BrokerNotAvailable = 8,
    /// A replica was expected on a broker but is not there.
    ReplicaNotAvailable = 9,
    /// The broker disconnected before a response was received.
    NetworkException = 13,
    /// The group or transaction coordinator is still loading state.
    CoordinatorLoadInProgress = 14,
    /// The coordinator is not available (offsets topic missing, or the
    /// coordinator is not active).
    CoordinatorNotAvailable = 15,
    /// The broker that received the request is not the coordinator for the
    /// group or transactional ID.
    NotCoordinator = 16,
    /// The request accessed an invalid or internal topic.
    InvalidTopic = 17,
    /// Fewer in-sync replicas than required.
    NotEnoughReplicas = 19,
    /// Written, but with fewer in-sync replicas than required.
    NotEnoughReplicasAfterAppend = 20,
    /// The generation id in the request is not the group's current
    /// generation; a rebalance began and completed underneath the member.
    IllegalGeneration = 22,
    /// The member id is not in the current generation.
    UnknownMemberId = 25,
    /// The coordinator has begun rebalancing the group; the member should
    /// rejoin.
    RebalanceInProgress = 27,
    /// The client is not authorized to access the topic.
    TopicAuthorizationFailed = 29,
    /// The client is not authorized to access the group.
    GroupAuthorizationFailed = 30,
    /// The requested API version is not supported.
    UnsupportedVersion = 35,
    /// This broker is not the cluster controller.
    NotController = 41,
    /// The producer used a sequence number outside the valid range.
    OutOfOrderSequenceNumber = 45,
    /// The producer reused a sequence number.
    DuplicateSequenceNumber = 46,
    /// The producer's epoch is stale; a newer instance fenced this one, or
    /// the epoch was bumped by the coordinator.
    InvalidProducerEpoch = 47,
    /// The transaction attempted a state transition that is not valid.
    InvalidTxnState = 48,
    /// The producer id does not map to the transactional id in the request.
    InvalidProducerIdMapping = 49,
    /// The transaction timeout exceeds the broker's maximum.
    InvalidTransactionTimeout = 50,
    /// The previous transaction for this producer has not finished
    /// committing or aborting yet.
    ConcurrentTransactions = 51,
    /// The transaction coordinator fenced this producer.
    TransactionCoordinatorFenced = 52,
    /// The client is not authorized to use the transactional id.
    TransactionalIdAuthorizationFailed = 53,
    /// The broker refused to attempt the operation, typically an EndTxn
    /// commit while the producer id is in an error state. Retry as abort.
    OperationNotAttempted = 55,
    /// Disk error while the broker processed the request.
    KafkaStorageError = 56,
    /// The broker has no state for this producer id; its records expired or
    /// the id was never initialized.
    UnknownProducerId = 59,
    /// The leader epoch in the request is older than the broker's.
    FencedLeaderEpoch = 74,
    /// The leader epoch in the request is newer than the broker's.
    UnknownLeaderEpoch = 75,
}

impl KafkaCode {
    /// Map a wire error code to a [`KafkaCode`].
    ///
    /// Returns `None` for code `0` (no error). Codes this client does not
    /// track map to [`KafkaCode::Unknown`].
    pub fn from_wire(code: i16) -> Option<KafkaCode> {
        match code {
            0 => None,
            c => Some(KafkaCode::from_i16(c).unwrap_or(KafkaCode::Unknown)),
        }
    }

    /// Whether the protocol classifies this code as retriable.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            KafkaCode::CorruptMessage
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::ReplicaNotAvailable
                | KafkaCode::NetworkException
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::NotEnoughReplicas
                | KafkaCode::NotEnoughReplicasAfterAppend
                | KafkaCode::NotController
                | KafkaCode::ConcurrentTransactions
                | KafkaCode::KafkaStorageError
                | KafkaCode::FencedLeaderEpoch
                | KafkaCode::UnknownLeaderEpoch
        )
    }

    /// Whether a transactional offset commit that returned this code for a
    /// partition should abort the transaction rather than fail the session.
    ///
    /// These are the rebalance-and-coordinator conditions where the commit
    /// cannot be trusted but the session itself is healthy.
    pub fn is_abortable_commit(self) -> bool {
        matches!(
            self,
            KafkaCode::IllegalGeneration
                | KafkaCode::RebalanceInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::NotCoordinator
        )
    }
}

impl fmt::Display for KafkaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything the coordination core can surface.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A broker responded with a protocol error code.
    #[error("kafka error: {0}")]
    Kafka(KafkaCode),

    /// The partition disappeared from fresh metadata; all records buffered
    /// for it have been failed and its consumption removed.
    #[error("partition was deleted from the cluster")]
    PartitionDeleted,

    /// Metadata named a leader broker the client does not know.
    #[error("metadata for topic {topic} partition {partition} names unknown broker {broker}")]
    UnknownBrokerForPartition {
        topic: String,
        partition: i32,
        broker: i32,
    },

    /// A transactional operation was attempted without a transactional id.
    #[error("invalid attempt to use transactions when a transactional id is not configured")]
    NotTransactional,

    /// A transactional operation requires an open transaction.
    #[error("invalid attempt to commit outside of a transaction")]
    NotInTransaction,

    /// Begin was called while a transaction is already open.
    #[error("invalid attempt to begin a transaction while already in a transaction")]
    AlreadyInTransaction,

    /// A group-scoped operation was attempted without a group consumer.
    #[error("invalid attempt to use a group operation on a client with no group")]
    NotGroup,

    /// A transact session requires a configured group.
    #[error("missing required group")]
    MissingGroup,

    /// The producer id entered an unrecoverable state.
    #[error("producer id has a fatal, unrecoverable error: {0}")]
    FatalProducerId(Box<Error>),

    /// Internal state: the producer id must be reloaded before use. The
    /// next request for the id issues InitProducerId.
    #[error("producer id needs reloading")]
    ReloadProducerId,

    /// One or more partitions failed during a transactional offset commit.
    #[error("unable to commit transaction offsets: {0}")]
    CommitFailed(String),

    /// The operation's context was cancelled before it finished.
    #[error("operation cancelled by context")]
    Cancelled,

    /// The client is shutting down.
    #[error("client is shutting down")]
    Shutdown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The wire code behind this error, if it came off the wire.
    pub fn kafka_code(&self) -> Option<KafkaCode> {
        match self {
            Error::Kafka(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Kafka(code) => code.is_retriable(),
            _ => false,
        }
    }

    /// Lift a wire error code into a client error. `None` when the code
    /// reports success.
    pub fn from_wire(code: i16) -> Option<Error> {
        KafkaCode::from_wire(code).map(Error::Kafka)
    }
}
