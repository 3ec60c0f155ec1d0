//! Producer identity and transactional producer state.
//!
//! The producer id is an immutable `{id, epoch, error}` record behind an
//! atomic pointer. Its error field encodes the state machine:
//!
//! - `None`: healthy, usable for producing.
//! - `Some(ReloadProducerId)`: the id must be re-initialized before the
//!   next use; the next request issues InitProducerId and sequence
//!   numbers reset with the fresh id.
//! - any other `Some`: fatal, surfaced to every caller.
//!
//! Recovery from broker errors into the reload state is gated on the
//! negotiated InitProducerId version: version 3 brokers recover unknown
//! producer ids and mappings (KIP-360), version 4 brokers additionally
//! recover epoch fencing by bumping the epoch (KIP-588).

use std::sync::atomic::{AtomicI32, AtomicU32};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::core::Client;
use super::traits::InitProducerIdRequest;
use crate::error::{Error, KafkaCode, Result};

/// An immutable producer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerId {
    pub id: i64,
    pub epoch: i16,
    /// State of the id; see the module docs.
    pub err: Option<Error>,
}

/// Mutable transactional flags, guarded by the transaction mutex.
#[derive(Debug, Default)]
pub(crate) struct TxnFlags {
    pub in_txn: bool,
}

/// Producer-side state on the client.
pub(crate) struct ProducerState {
    /// Current producer identity.
    pub id: ArcSwap<ProducerId>,
    /// 1 while a transaction admits records. Only ever 1 when `in_txn`.
    pub producing_txn: AtomicU32,
    /// Serializes Begin/End and guards `in_txn`.
    pub txn_mu: Mutex<TxnFlags>,
    /// Depth of concurrent abort-buffered-records calls.
    pub aborting: AtomicI32,
    /// Negotiated InitProducerId version; gates recovery.
    pub id_version: i16,
    /// Serializes id reloads so concurrent callers share one exchange.
    reload_mu: Mutex<()>,
}

impl ProducerState {
    pub(crate) fn new(id_version: i16) -> ProducerState {
        ProducerState {
            id: ArcSwap::from_pointee(ProducerId {
                id: -1,
                epoch: -1,
                err: Some(Error::ReloadProducerId),
            }),
            producing_txn: AtomicU32::new(0),
            txn_mu: Mutex::new(TxnFlags::default()),
            aborting: AtomicI32::new(0),
            id_version,
            reload_mu: Mutex::new(()),
        }
    }
}

impl Client {
    /// The current producer id and epoch, initializing or re-initializing
    /// the id first when it is pending a reload.
    ///
    /// Returns the stored error when the id is in a fatal state.
    pub async fn producer_id(&self) -> Result<(i64, i16)> {
        loop {
            let current = self.producer.id.load_full();
            match &current.err {
                None => return Ok((current.id, current.epoch)),
                Some(Error::ReloadProducerId) => self.reload_producer_id().await?,
                Some(err) => return Err(err.clone()),
            }
        }
    }

    async fn reload_producer_id(&self) -> Result<()> {
        let _guard = self.producer.reload_mu.lock().await;
        let current = self.producer.id.load_full();
        // another caller may have finished the reload while we waited
        if !matches!(&current.err, Some(Error::ReloadProducerId)) {
            return Ok(());
        }

        let req = InitProducerIdRequest {
            transactional_id: self.cfg.txn_id.clone(),
            current_id: current.id,
            current_epoch: current.epoch,
        };
        debug!(
            current_id = current.id,
            current_epoch = current.epoch,
            "issuing InitProducerId"
        );
        let broker = Arc::clone(&self.txn_broker);
        let resp = self
            .with_concurrent_txn("InitProducerId", || broker.init_producer_id(req.clone()))
            .await?;

        if let Some(err) = Error::from_wire(resp.error_code) {
            if err.is_retriable() {
                // stay reload-pending; the next request tries again
                return Err(err);
            }
            warn!(%err, "producer id initialization failed fatally");
            self.producer.id.store(Arc::new(ProducerId {
                id: current.id,
                epoch: current.epoch,
                err: Some(err.clone()),
            }));
            return Err(err);
        }

        info!(
            producer_id = resp.producer_id,
            epoch = resp.producer_epoch,
            "initialized producer id; sequence numbers reset"
        );
        self.producer.id.store(Arc::new(ProducerId {
            id: resp.producer_id,
            epoch: resp.producer_epoch,
            err: None,
        }));
        Ok(())
    }

    /// Classify the producer id's current error and, when recoverable,
    /// transition it into the reload state.
    ///
    /// Returns whether recovery was necessary, whether it happened, and
    /// the fatal error otherwise.
    pub(crate) async fn maybe_recover_producer_id(&self) -> (bool, bool, Option<Error>) {
        let err = match self.producer_id().await {
            Ok(_) => return (false, false, None),
            Err(err) => err,
        };

        let Some(code) = err.kafka_code() else {
            return (true, false, Some(err));
        };

        let kip360 = self.producer.id_version >= 3
            && matches!(
                code,
                KafkaCode::UnknownProducerId | KafkaCode::InvalidProducerIdMapping
            );
        let kip588 =
            self.producer.id_version >= 4 && matches!(code, KafkaCode::InvalidProducerEpoch);

        if !(kip360 || kip588) {
            return (true, false, Some(err));
        }

        let current = self.producer.id.load_full();
        info!(
            id = current.id,
            epoch = current.epoch,
            %err,
            "recoverable producer id error, scheduling reload"
        );
        self.producer.id.store(Arc::new(ProducerId {
            id: current.id,
            epoch: current.epoch,
            err: Some(Error::ReloadProducerId),
        }));
        (true, true, None)
    }

    /// Fail the producer id, but only if it still is the `{id, epoch}` the
    /// caller observed; a concurrently reloaded id stays untouched.
    pub(crate) fn fail_producer_id(&self, id: i64, epoch: i16, err: Error) {
        let mut current = self.producer.id.load_full();
        loop {
            if current.id != id || current.epoch != epoch || current.err.is_some() {
                debug!(
                    id,
                    epoch,
                    "not failing producer id, it moved on underneath us"
                );
                return;
            }
            let failed = Arc::new(ProducerId {
                id,
                epoch,
                err: Some(err.clone()),
            });
            let prev = self.producer.id.compare_and_swap(&current, failed);
            if Arc::ptr_eq(&prev, &current) {
                warn!(id, epoch, %err, "producer id failed");
                return;
            }
            current = Arc::clone(&prev);
        }
    }

    /// Whether records are currently admitted into a transaction.
    pub fn is_producing_txn(&self) -> bool {
        self.producer
            .producing_txn
            .load(std::sync::atomic::Ordering::SeqCst)
            == 1
    }
}
