//! Protocol and tuning constants.
//!
//! Durations here are deliberate protocol-behavior choices rather than
//! knobs; the configurable surface lives in [`crate::client::ClientConfig`].

use std::time::Duration;

/// Metadata younger than this is considered fresh; [`wait_metadata`] returns
/// without triggering a refresh when the last update is within this window.
///
/// [`wait_metadata`]: crate::client::Client::wait_metadata
pub const FRESH_METADATA_AGE: Duration = Duration::from_secs(1);

/// Pause after an immediate-refresh trigger before actually refreshing,
/// so that a burst of triggers collapses into one metadata request.
pub const METADATA_NOW_COALESCE: Duration = Duration::from_millis(50);

/// Maximum number of back-to-back refresh attempts while servicing an
/// immediate trigger before falling back to the eventual-trigger path.
pub const METADATA_NOW_MAX_TRIES: u32 = 10;

/// How long a committed transact session keeps the rebalance interlock held
/// after EndTxn, giving the cluster time to write transaction markers.
/// Skipped entirely when KIP-447 semantics were observed and stable fetch
/// offsets are required.
pub const POST_COMMIT_UNLOCK_DELAY: Duration = Duration::from_millis(200);

/// Wall-clock window in which a request failing with CONCURRENT_TRANSACTIONS
/// is retried. Measured from the first attempt.
pub const CONCURRENT_TXN_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Default upper bound between two metadata refreshes.
pub const DEFAULT_METADATA_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Default lower bound between two metadata refreshes. An immediate trigger
/// bypasses this floor.
pub const DEFAULT_METADATA_MIN_AGE: Duration = Duration::from_secs(10);

/// Default sleep between retries of a transactional request that hit
/// CONCURRENT_TRANSACTIONS.
pub const DEFAULT_TXN_BACKOFF: Duration = Duration::from_millis(20);

/// Default floor for the exponential metadata retry backoff.
pub const DEFAULT_RETRY_BACKOFF_MIN: Duration = Duration::from_millis(250);

/// Default ceiling for the exponential metadata retry backoff.
pub const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_millis(2500);

/// Default number of times a buffered batch may be retried before its
/// records are failed.
pub const DEFAULT_RECORD_RETRIES: u32 = 10;

/// Default InitProducerId protocol version the client negotiates. Version 3
/// enables KIP-360 recovery, version 4 enables KIP-588 recovery.
pub const DEFAULT_ID_VERSION: i16 = 4;

/// Sentinel for an offset that has not been set.
pub const OFFSET_UNSET: i64 = -1;

/// Sentinel for a leader epoch the broker did not supply (metadata
/// responses older than version 7 carry no epoch).
pub const EPOCH_UNSET: i32 = -1;

/// Sentinel index meaning "not registered with any sink or source".
pub const INDEX_UNREGISTERED: i32 = -1;
