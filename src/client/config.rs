//! Client configuration.
//!
//! [`ClientConfig`] carries every option the coordination core recognizes,
//! with defaults that match broker expectations. Construct one, adjust the
//! fields you care about, and pass it to [`Client::new`].
//!
//! [`Client::new`]: crate::client::Client::new

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::constants::{
    DEFAULT_ID_VERSION, DEFAULT_METADATA_MAX_AGE, DEFAULT_METADATA_MIN_AGE,
    DEFAULT_RECORD_RETRIES, DEFAULT_RETRY_BACKOFF_MAX, DEFAULT_RETRY_BACKOFF_MIN,
    DEFAULT_TXN_BACKOFF,
};
use crate::error::{Error, Result};

/// Topic name to revoked or lost partition ids, as delivered by the group
/// rebalance machinery.
pub type RebalanceMap = HashMap<String, Vec<i32>>;

/// User callback invoked when group partitions are revoked or lost.
pub type RebalanceCallback = Arc<dyn Fn(&RebalanceMap) + Send + Sync>;

/// Backoff schedule as a function of the consecutive-failure count.
pub type RetryBackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Options recognized by the coordination core.
#[derive(Clone)]
pub struct ClientConfig {
    /// Upper bound between metadata refreshes; the refresh loop ticks at
    /// this period even with no triggers.
    pub metadata_max_age: Duration,

    /// Lower bound between metadata refreshes. Eventual triggers wait out
    /// this floor; immediate triggers bypass it.
    pub metadata_min_age: Duration,

    /// Backoff applied between refresh attempts after consecutive failures.
    pub retry_backoff: RetryBackoffFn,

    /// Sleep between retries of transactional requests that hit
    /// CONCURRENT_TRANSACTIONS.
    pub txn_backoff: Duration,

    /// Require the broker to block offset fetches on open transactions
    /// (KIP-447). With this set and a KIP-447 broker, the session skips its
    /// post-commit settling sleep.
    pub require_stable_fetch_offsets: bool,

    /// Transactional id. Absent means the client is not transactional and
    /// transaction operations fail.
    pub txn_id: Option<String>,

    /// InitProducerId protocol version. Gates which producer-id errors are
    /// recoverable: version 3 adds KIP-360 recovery, version 4 adds
    /// KIP-588 recovery.
    pub id_version: i16,

    /// Consumer group, when group consuming.
    pub group: Option<String>,

    /// Whether the group uses cooperative (incremental) rebalancing. A
    /// cooperative revoke of nothing is a no-op for transact sessions.
    pub cooperative: bool,

    /// Whether topics are subscribed to by regular expression. Forces
    /// metadata fetches for all topics so new matches are discovered.
    pub regex_topics: bool,

    /// How long a partition's record buffer lingers before its sink drains
    /// a batch.
    pub linger: Duration,

    /// How many times a buffered batch is retried before its records fail.
    pub record_retries: u32,

    /// Called when group partitions are revoked.
    pub on_revoked: Option<RebalanceCallback>,

    /// Called when group partitions are lost. Falls back to `on_revoked`
    /// when unset.
    pub on_lost: Option<RebalanceCallback>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            metadata_max_age: DEFAULT_METADATA_MAX_AGE,
            metadata_min_age: DEFAULT_METADATA_MIN_AGE,
            retry_backoff: default_retry_backoff(),
            txn_backoff: DEFAULT_TXN_BACKOFF,
            require_stable_fetch_offsets: false,
            txn_id: None,
            id_version: DEFAULT_ID_VERSION,
            group: None,
            cooperative: false,
            regex_topics: false,
            linger: Duration::ZERO,
            record_retries: DEFAULT_RECORD_RETRIES,
            on_revoked: None,
            on_lost: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("metadata_max_age", &self.metadata_max_age)
            .field("metadata_min_age", &self.metadata_min_age)
            .field("txn_backoff", &self.txn_backoff)
            .field(
                "require_stable_fetch_offsets",
                &self.require_stable_fetch_offsets,
            )
            .field("txn_id", &self.txn_id)
            .field("id_version", &self.id_version)
            .field("group", &self.group)
            .field("cooperative", &self.cooperative)
            .field("regex_topics", &self.regex_topics)
            .field("linger", &self.linger)
            .field("record_retries", &self.record_retries)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Check the configuration for internally inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.metadata_min_age > self.metadata_max_age {
            return Err(Error::Config(format!(
                "metadata_min_age {:?} exceeds metadata_max_age {:?}",
                self.metadata_min_age, self.metadata_max_age
            )));
        }
        if let Some(id) = &self.txn_id {
            if id.is_empty() {
                return Err(Error::Config("transactional id must not be empty".into()));
            }
        }
        if let Some(group) = &self.group {
            if group.is_empty() {
                return Err(Error::Config("group must not be empty".into()));
            }
        }
        if self.txn_backoff.is_zero() {
            return Err(Error::Config("txn_backoff must be non-zero".into()));
        }
        Ok(())
    }

    /// Whether this client is configured transactionally.
    pub fn is_transactional(&self) -> bool {
        self.txn_id.is_some()
    }
}

/// Exponential backoff with jitter, doubling from the configured floor and
/// capped at the ceiling.
pub fn default_retry_backoff() -> RetryBackoffFn {
    Arc::new(|consecutive| {
        let exp = consecutive.saturating_sub(1).min(16);
        let base = DEFAULT_RETRY_BACKOFF_MIN.saturating_mul(1u32 << exp);
        let capped = base.min(DEFAULT_RETRY_BACKOFF_MAX);
        // up to 20% jitter, spreading simultaneous retries apart
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter)
    })
}
