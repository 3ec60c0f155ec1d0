//! The client: configuration, collaborators, and shared state wired
//! together, plus the lifecycle of the background refresh loop.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::broker::BrokerHandle;
use super::config::ClientConfig;
use super::cursor::{ConsumerState, ConsumptionCursor};
use super::metadata::MetaWait;
use super::producer::ProducerState;
use super::topics::TopicMap;
use super::traits::{GroupConsumer, MetadataFetcher, OffsetMap, ProducerDriver, TxnBroker};
use super::txn::{GroupTxnState, SessionInterlock};
use crate::error::Result;

/// The external collaborators a client coordinates.
#[derive(Clone)]
pub struct Collaborators {
    /// Fetches cluster metadata off the wire.
    pub fetcher: Arc<dyn MetadataFetcher>,
    /// The produce pump's flush/abort surface.
    pub producer: Arc<dyn ProducerDriver>,
    /// Transactional RPCs.
    pub txn: Arc<dyn TxnBroker>,
    /// The group consumer, when group consuming.
    pub group: Option<Arc<dyn GroupConsumer>>,
}

/// The coordination core of a Kafka client.
///
/// Owns the topic snapshots, the metadata refresh loop, producer identity,
/// and the transactional state machine. Everything wire-level arrives
/// through [`Collaborators`].
pub struct Client {
    pub(crate) cfg: ClientConfig,
    pub(crate) shutdown: CancellationToken,

    pub(crate) topics: TopicMap,
    pub(crate) metawait: MetaWait,
    pub(crate) update_tx: mpsc::Sender<()>,
    pub(crate) update_now_tx: mpsc::Sender<()>,
    pub(crate) brokers: DashMap<i32, BrokerHandle>,

    pub(crate) producer: ProducerState,
    pub(crate) consumer: ConsumerState,
    pub(crate) group_txn: tokio::sync::Mutex<GroupTxnState>,
    session_interlock: ArcSwapOption<SessionInterlock>,

    pub(crate) fetcher: Arc<dyn MetadataFetcher>,
    pub(crate) driver: Arc<dyn ProducerDriver>,
    pub(crate) txn_broker: Arc<dyn TxnBroker>,
    group: Option<Arc<dyn GroupConsumer>>,

    metadata_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client and start its metadata refresh loop.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(cfg: ClientConfig, collaborators: Collaborators) -> Result<Arc<Client>> {
        cfg.validate()?;

        // capacity-one triggers: a full channel already means "refresh
        // pending", extra sends are dropped
        let (update_tx, update_rx) = mpsc::channel(1);
        let (update_now_tx, update_now_rx) = mpsc::channel(1);

        let id_version = cfg.id_version;
        let client = Arc::new(Client {
            cfg,
            shutdown: CancellationToken::new(),
            topics: TopicMap::default(),
            metawait: MetaWait::new(),
            update_tx,
            update_now_tx,
            brokers: DashMap::new(),
            producer: ProducerState::new(id_version),
            consumer: ConsumerState::default(),
            group_txn: tokio::sync::Mutex::new(GroupTxnState::default()),
            session_interlock: ArcSwapOption::empty(),
            fetcher: collaborators.fetcher,
            driver: collaborators.producer,
            txn_broker: collaborators.txn,
            group: collaborators.group,
            metadata_task: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&client).metadata_loop(update_rx, update_now_rx));
        *client.metadata_task.lock().unwrap() = Some(task);

        Ok(client)
    }

    /// The effective configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// A token cancelled when the client shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The published topic snapshots.
    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    /// The sink/source pair for a broker, if it is known.
    pub fn broker(&self, id: i32) -> Option<BrokerHandle> {
        self.brokers.get(&id).map(|handle| handle.value().clone())
    }

    /// Track `topics` for producing or consuming and request a refresh so
    /// their metadata loads.
    pub fn track_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.topics.ensure_topics(topics) {
            self.trigger_update_metadata();
        }
    }

    /// Begin consuming through a partition's cursor, registering it with
    /// the consumer bookkeeping so partition deletion can clear it.
    pub fn track_consumption(&self, topic: &str, partition: i32) -> Option<Arc<ConsumptionCursor>> {
        let tp = self.topics.get(topic)?;
        let entry = tp.load().all.get(&partition).cloned()?;
        self.consumer.track(Arc::clone(&entry.cursor));
        Some(Arc::clone(&entry.cursor))
    }

    /// Offsets most recently committed to the broker, or empty with no
    /// group.
    pub fn committed_offsets(&self) -> OffsetMap {
        self.group
            .as_ref()
            .map(|g| g.committed_offsets())
            .unwrap_or_default()
    }

    /// Offsets consumed but not yet committed, or empty with no group.
    pub fn uncommitted_offsets(&self) -> OffsetMap {
        self.group
            .as_ref()
            .map(|g| g.uncommitted_offsets())
            .unwrap_or_default()
    }

    /// Overwrite the group consumer's offsets.
    pub fn set_offsets(&self, offsets: OffsetMap, from_reset: bool) {
        if let Some(group) = &self.group {
            group.set_offsets(offsets, from_reset);
        }
    }

    pub(crate) fn group_consumer(&self) -> Option<Arc<dyn GroupConsumer>> {
        self.group.clone()
    }

    pub(crate) fn install_session_interlock(&self, interlock: SessionInterlock) {
        self.session_interlock.store(Some(Arc::new(interlock)));
    }

    pub(crate) fn session_interlock(&self) -> Option<Arc<SessionInterlock>> {
        self.session_interlock.load_full()
    }

    /// Shut the client down: stop the refresh loop and cancel everything
    /// waiting on the client's lifetime.
    pub async fn close(&self) {
        info!("closing client");
        self.shutdown.cancel();
        let task = self.metadata_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cfg", &self.cfg)
            .field("tracked_topics", &self.topics.tracked())
            .field("brokers", &self.brokers.len())
            .field("group", &self.cfg.group)
            .finish_non_exhaustive()
    }
}
