//! Group transactions: the session interlock, Begin/End, transactional
//! offset commits, and the concurrent-transactions retry envelope.
//!
//! A [`GroupTransactSession`] binds a group consumer to a transactional
//! producer for consume-modify-produce exactly-once work. Its core rule
//! favors correctness over throughput: a rebalance at any point before a
//! transaction ends with a commit forces the transaction to abort. Waiting
//! out a slow work loop instead would risk exceeding the rebalance timeout
//! and, on older clusters, committing anyway and duplicating output.
//!
//! The interlock is a mutex over two one-shot flag/token pairs, `revoked`
//! and `lost`. Rebalance callbacks set the flag and cancel the token while
//! holding the mutex; [`GroupTransactSession::end`] holds the same mutex
//! across its EndTxn decision, so a revoke either lands before the
//! decision (and aborts it) or blocks until the session releases the
//! lock. After a commit on a pre-KIP-447 path, release is delayed 200ms
//! to give the cluster time to write transaction markers before a
//! rebalance lets another member fetch offsets. That delay is best
//! effort; requiring stable fetch offsets against a KIP-447 broker is the
//! complete fix.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::config::RebalanceMap;
use super::core::Client;
use super::traits::{
    AddOffsetsToTxnRequest, EndTxnRequest, OffsetMap, TxnOffsetCommitReqPartition,
    TxnOffsetCommitReqTopic, TxnOffsetCommitRequest, TxnOffsetCommitResponse,
};
use crate::constants::{CONCURRENT_TXN_RETRY_WINDOW, POST_COMMIT_UNLOCK_DELAY};
use crate::error::{Error, KafkaCode, Result};

/// How to end a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEnd {
    /// End the transaction by aborting it.
    Abort,
    /// End the transaction by committing it.
    Commit,
}

impl TransactionEnd {
    pub fn is_commit(self) -> bool {
        matches!(self, TransactionEnd::Commit)
    }

    pub(crate) fn from_commit(commit: bool) -> TransactionEnd {
        if commit {
            TransactionEnd::Commit
        } else {
            TransactionEnd::Abort
        }
    }
}

/// Revocation state for one session generation. The tokens are cancelled
/// exactly once, when the matching flag is first set; End replaces the
/// whole state so each transaction observes only its own events.
#[derive(Debug)]
pub(crate) struct SessionFailState {
    pub revoked: bool,
    pub revoked_token: CancellationToken,
    pub lost: bool,
    pub lost_token: CancellationToken,
}

impl SessionFailState {
    pub(crate) fn new() -> SessionFailState {
        SessionFailState {
            revoked: false,
            revoked_token: CancellationToken::new(),
            lost: false,
            lost_token: CancellationToken::new(),
        }
    }
}

/// The piece of session state the client's rebalance hooks interlock
/// with.
pub(crate) struct SessionInterlock {
    pub cooperative: bool,
    pub fail: Arc<Mutex<SessionFailState>>,
}

/// Transactional state for the client's group consumer.
#[derive(Default)]
pub(crate) struct GroupTxnState {
    /// Whether AddOffsetsToTxn was issued for the open transaction.
    pub offsets_added_to_txn: bool,
    /// Cancels the in-flight offset commit, if one is running.
    pub commit_cancel: Option<CancellationToken>,
    /// Resolves when the in-flight offset commit finishes.
    pub commit_done: Option<oneshot::Receiver<()>>,
}

/// A transact session: a client wrapped so that group rebalances and
/// transaction ends cannot interleave incorrectly.
pub struct GroupTransactSession {
    client: Arc<Client>,
    cooperative: bool,
    fail: Arc<Mutex<SessionFailState>>,
}

impl GroupTransactSession {
    /// Wrap `client` in a transact session.
    ///
    /// The client must be configured with a group; its rebalance hooks are
    /// chained behind the session's revocation interlock from here on.
    pub fn new(client: Arc<Client>) -> Result<GroupTransactSession> {
        if client.cfg.group.is_none() || client.group_consumer().is_none() {
            return Err(Error::MissingGroup);
        }
        let cooperative = client.cfg.cooperative;
        let fail = Arc::new(Mutex::new(SessionFailState::new()));
        client.install_session_interlock(SessionInterlock {
            cooperative,
            fail: Arc::clone(&fail),
        });
        Ok(GroupTransactSession {
            client,
            cooperative,
            fail,
        })
    }

    /// The wrapped client, for everything that is not transaction
    /// management.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Whether the underlying group rebalances cooperatively.
    pub fn cooperative(&self) -> bool {
        self.cooperative
    }

    /// Close the wrapped client.
    pub async fn close(&self) {
        self.client.close().await;
    }

    /// Begin a transaction.
    ///
    /// A revoke observed before Begin still counts against the next End;
    /// the revocation state only resets when End finishes.
    pub async fn begin(&self) -> Result<()> {
        info!("beginning transact session");
        self.client.begin_transaction().await
    }

    /// End the open transaction, committing only if `commit` asks for it,
    /// no rebalance intervened, offsets committed cleanly, and the group
    /// heartbeat confirmed membership.
    ///
    /// Returns whether the transaction committed. No returned error is
    /// retriable.
    ///
    /// Cancelling `ctx` is allowed but discouraged: it cancels in-flight
    /// requests mid-sequence and can leave the session partial, with
    /// offsets committed but the transaction never ended or the reverse.
    pub async fn end(&self, ctx: &CancellationToken, commit: TransactionEnd) -> Result<bool> {
        let result = self.end_inner(ctx, commit).await;
        // reset revocation state for the next transaction; this waits out
        // a delayed post-commit unlock
        let mut fail = self.fail.lock().await;
        *fail = SessionFailState::new();
        drop(fail);
        result
    }

    async fn end_inner(&self, ctx: &CancellationToken, commit: TransactionEnd) -> Result<bool> {
        let want_commit = commit.is_commit();

        // an error here is the context closing; nothing was decided yet
        match commit {
            TransactionEnd::Commit => self.client.flush(ctx).await?,
            TransactionEnd::Abort => self.client.abort_buffered_records(ctx).await?,
        }

        let (failed, precommit, postcommit, revoked_token, lost_token) = {
            let fail = self.fail.lock().await;
            (
                fail.revoked || fail.lost,
                self.client.committed_offsets(),
                self.client.uncommitted_offsets(),
                fail.revoked_token.clone(),
                fail.lost_token.clone(),
            )
        };

        let mut kip447 = false;
        let mut group_present = false;
        let mut has_abortable_commit_err = false;
        let mut commit_err: Option<Error> = None;

        if want_commit && !failed {
            let mut commit_errs: Vec<String> = Vec::new();

            let (present, done) = self
                .client
                .commit_transaction_offsets(ctx, postcommit.clone())
                .await;
            group_present = present;

            match done.await {
                Err(_) => commit_errs.push("offset commit abandoned".to_string()),
                Ok(Err(err)) => commit_errs.push(err.to_string()),
                Ok(Ok(resp)) => {
                    kip447 = resp.version >= 3;
                    for topic in &resp.topics {
                        for partition in &topic.partitions {
                            match KafkaCode::from_wire(partition.error_code) {
                                None => {}
                                Some(code) if code.is_abortable_commit() => {
                                    has_abortable_commit_err = true;
                                }
                                Some(code) => commit_errs.push(format!(
                                    "topic {} partition {}: {}",
                                    topic.topic, partition.partition, code
                                )),
                            }
                        }
                    }
                }
            }

            if !commit_errs.is_empty() {
                commit_err = Some(Error::CommitFailed(commit_errs.join(", ")));
            }
        }

        // With offsets committed, force a heartbeat before using them. A
        // clean heartbeat means membership holds for a full rebalance
        // timeout, which is plenty for the single EndTxn request below.
        let mut ok_heartbeat = false;
        if group_present && commit_err.is_none() {
            if let Some(group) = self.client.group_consumer() {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sender = group.heartbeat_force();
                tokio::select! {
                    sent = sender.send(reply_tx) => {
                        if sent.is_ok() {
                            tokio::select! {
                                reply = reply_rx => {
                                    ok_heartbeat = matches!(reply, Ok(Ok(())));
                                }
                                _ = revoked_token.cancelled() => {}
                                _ = lost_token.cancelled() => {}
                            }
                        }
                    }
                    _ = revoked_token.cancelled() => {}
                    _ = lost_token.cancelled() => {}
                }
            }
        }

        // Hold the interlock through the EndTxn decision so a rebalance
        // cannot slip between deciding to commit and committing.
        let guard = Arc::clone(&self.fail).lock_owned().await;

        let was_failed = guard.revoked || guard.lost;
        let try_commit =
            !was_failed && commit_err.is_none() && !has_abortable_commit_err && ok_heartbeat;
        let mut will_try_commit = want_commit && try_commit;

        info!(
            was_failed,
            want_commit,
            can_try_commit = try_commit,
            will_try_commit,
            "transaction session ending"
        );

        let mut retried = false;
        let end_txn_err = loop {
            let err = self
                .client
                .end_transaction(TransactionEnd::from_commit(will_try_commit))
                .await
                .err();
            if matches!(
                &err,
                Some(Error::Kafka(KafkaCode::OperationNotAttempted))
            ) && !retried
            {
                will_try_commit = false;
                retried = true;
                info!("end transaction with commit not attempted; retrying as abort");
                continue;
            }
            break err;
        };

        let committed = will_try_commit && end_txn_err.is_none();

        if committed {
            debug!(
                ?postcommit,
                "transact session successful, setting to newly committed state"
            );
            self.client.set_offsets(postcommit, false);
        } else {
            let current = self.client.committed_offsets();
            info!(
                tried_commit = will_try_commit,
                ?precommit,
                ?current,
                "transact session resetting to currently committed state"
            );
            self.client.set_offsets(current, false);
        }

        if kip447 && self.client.cfg.require_stable_fetch_offsets {
            // the broker blocks rebalance offset fetches itself; no
            // settling delay needed
            drop(guard);
        } else if committed {
            debug!(
                "holding rebalance interlock briefly so txn markers can propagate before offsets are fetched"
            );
            tokio::spawn(async move {
                tokio::time::sleep(POST_COMMIT_UNLOCK_DELAY).await;
                drop(guard);
            });
        } else {
            drop(guard);
        }

        match (commit_err, end_txn_err) {
            (None, None) => Ok(committed),
            (_, Some(end_err)) => Err(end_err),
            (Some(commit_err), None) => Err(commit_err),
        }
    }
}

impl Client {
    /// Group rebalance hook: partitions are being revoked.
    ///
    /// When a transact session is installed this records the revocation
    /// first, aborting the session's next commit, with one exception: a
    /// cooperative rebalance that revokes nothing leaves the session
    /// clean. The configured user callback runs after, under the same
    /// lock.
    pub async fn on_group_revoked(&self, revoked: &RebalanceMap) {
        if let Some(interlock) = self.session_interlock() {
            let mut fail = interlock.fail.lock().await;
            if fail.revoked {
                return;
            }
            if interlock.cooperative && revoked.is_empty() {
                info!("transact session revoked nothing; allowing the next commit");
            } else {
                info!("transact session revoked; aborting the next commit if a transaction is open");
                fail.revoked = true;
                fail.revoked_token.cancel();
            }
            if let Some(cb) = &self.cfg.on_revoked {
                cb(revoked);
            }
            return;
        }
        if let Some(cb) = &self.cfg.on_revoked {
            cb(revoked);
        }
    }

    /// Group rebalance hook: partitions were lost without a clean revoke.
    ///
    /// Always fails the session's next commit. Chains to the configured
    /// lost callback, or the revoked callback when no lost callback is
    /// set.
    pub async fn on_group_lost(&self, lost: &RebalanceMap) {
        if let Some(interlock) = self.session_interlock() {
            let mut fail = interlock.fail.lock().await;
            if fail.lost {
                return;
            }
            info!("transact session lost partitions; aborting the next commit if a transaction is open");
            fail.lost = true;
            fail.lost_token.cancel();
            match (&self.cfg.on_lost, &self.cfg.on_revoked) {
                (Some(cb), _) => cb(lost),
                (None, Some(cb)) => cb(lost),
                (None, None) => {}
            }
            return;
        }
        match (&self.cfg.on_lost, &self.cfg.on_revoked) {
            (Some(cb), _) => cb(lost),
            (None, Some(cb)) => cb(lost),
            (None, None) => {}
        }
    }

    /// Enter a transactional state.
    ///
    /// Fails without a transactional id, while already in a transaction,
    /// or when the producer id is fatally errored. A recoverable producer
    /// id error is recovered inline.
    pub async fn begin_transaction(&self) -> Result<()> {
        if self.cfg.txn_id.is_none() {
            return Err(Error::NotTransactional);
        }

        let mut txn = self.producer.txn_mu.lock().await;
        if txn.in_txn {
            return Err(Error::AlreadyInTransaction);
        }

        let (need_recover, did_recover, err) = self.maybe_recover_producer_id().await;
        if need_recover && !did_recover {
            let cause = err.unwrap_or(Error::ReloadProducerId);
            info!(%cause, "unable to begin transaction due to unrecoverable producer id error");
            return Err(Error::FatalProducerId(Box::new(cause)));
        }

        txn.in_txn = true;
        self.producer.producing_txn.store(1, Ordering::SeqCst);
        info!(
            transactional_id = self.cfg.txn_id.as_deref().unwrap_or_default(),
            "beginning transaction"
        );
        Ok(())
    }

    /// Wait for all buffered records to drain.
    pub async fn flush(&self, ctx: &CancellationToken) -> Result<()> {
        self.driver.flush(ctx).await
    }

    /// Fail all unflushed records and wait for the backlog to clear, so
    /// nothing buffered now leaks into a later transaction.
    pub async fn abort_buffered_records(&self, ctx: &CancellationToken) -> Result<()> {
        self.producer.aborting.fetch_add(1, Ordering::SeqCst);
        info!("producer state set to aborting; continuing to wait via flushing");
        let result = self.driver.abort_buffered_records(ctx).await;
        self.producer.aborting.fetch_sub(1, Ordering::SeqCst);
        debug!("aborted buffered records");
        result
    }

    /// End the transaction and leave the transactional state.
    ///
    /// Buffered records must already be flushed or aborted. A transaction
    /// that never added a partition or an offset is ended without any
    /// request; Kafka never learned it existed.
    ///
    /// A producer id error surfaces as OperationNotAttempted when
    /// committing (retry with an abort); when aborting, a recoverable id
    /// is recovered and the EndTxn skipped, the fresh id having made it
    /// moot.
    pub async fn end_transaction(&self, commit: TransactionEnd) -> Result<()> {
        let mut txn = self.producer.txn_mu.lock().await;

        // no new records enter the transaction from here on
        self.producer.producing_txn.store(0, Ordering::SeqCst);

        let mut any_added = false;
        if self.group_consumer().is_some() {
            let mut gtxn = self.group_txn.lock().await;
            if gtxn.offsets_added_to_txn {
                gtxn.offsets_added_to_txn = false;
                any_added = true;
            }
        } else {
            debug!("transaction ending with no group loaded; this is a producer-only transaction");
        }

        if !txn.in_txn {
            return Ok(());
        }
        txn.in_txn = false;

        // flushed already, so the flags are stable reads
        for tp in self.topics.load().values() {
            for entry in tp.load().all.values() {
                if entry.records.take_added_to_txn() {
                    any_added = true;
                }
            }
        }

        if !any_added {
            info!("no partitions or offsets were added; ending the transaction without a request");
            return Ok(());
        }

        let (id, epoch) = match self.producer_id().await {
            Ok(pair) => pair,
            Err(_) if commit.is_commit() => {
                return Err(Error::Kafka(KafkaCode::OperationNotAttempted));
            }
            Err(_) => {
                let (_, did_recover, _) = self.maybe_recover_producer_id().await;
                if did_recover {
                    debug!("producer id recovered during abort; skipping EndTxn for the stale id");
                    return Ok(());
                }
                let stale = self.producer.id.load_full();
                (stale.id, stale.epoch)
            }
        };

        info!(
            transactional_id = self.cfg.txn_id.as_deref().unwrap_or_default(),
            producer_id = id,
            epoch,
            commit = commit.is_commit(),
            "ending transaction"
        );

        let req = EndTxnRequest {
            transactional_id: self.cfg.txn_id.clone().unwrap_or_default(),
            producer_id: id,
            producer_epoch: epoch,
            commit: commit.is_commit(),
        };
        let broker = Arc::clone(&self.txn_broker);
        let result = self
            .with_concurrent_txn("EndTxn", || {
                let fut = broker.end_txn(req.clone());
                async move {
                    match Error::from_wire(fut.await?) {
                        None => Ok(()),
                        Some(err) => Err(err),
                    }
                }
            })
            .await;

        if let Err(err) = &result {
            if err.kafka_code().is_some() && !err.is_retriable() {
                self.fail_producer_id(id, epoch, err.clone());
            }
        }
        result
    }

    /// Commit `uncommitted` within the open transaction.
    ///
    /// Returns whether a group consumer is present, plus a receiver that
    /// resolves with the commit outcome. The first commit of a
    /// transaction issues AddOffsetsToTxn first, which is how a
    /// consume-only transaction begins within Kafka.
    ///
    /// At most one commit is in flight per group: a newer commit cancels
    /// the prior one and waits for it to finish before issuing. The
    /// commit runs under the group's context, because leaving the group
    /// must abort it; the caller's context is honored as an additional
    /// cancellation source.
    pub(crate) async fn commit_transaction_offsets(
        &self,
        ctx: &CancellationToken,
        uncommitted: OffsetMap,
    ) -> (bool, oneshot::Receiver<Result<TxnOffsetCommitResponse>>) {
        let (done_tx, done_rx) = oneshot::channel();
        debug!(topics = uncommitted.len(), "committing transaction offsets");

        if self.cfg.txn_id.is_none() {
            let _ = done_tx.send(Err(Error::NotTransactional));
            return (false, done_rx);
        }
        {
            // check and release: holding the transaction mutex across the
            // commit would deadlock an EndTransaction racing to cut it off
            let txn = self.producer.txn_mu.lock().await;
            if !txn.in_txn {
                let _ = done_tx.send(Err(Error::NotInTransaction));
                return (false, done_rx);
            }
        }

        let Some(group) = self.group_consumer() else {
            let _ = done_tx.send(Err(Error::NotGroup));
            return (false, done_rx);
        };
        if uncommitted.is_empty() {
            let _ = done_tx.send(Ok(TxnOffsetCommitResponse::default()));
            return (true, done_rx);
        }

        let mut gtxn = self.group_txn.lock().await;
        if !gtxn.offsets_added_to_txn {
            if let Err(err) = self.add_offsets_to_txn(group.group()).await {
                let _ = done_tx.send(Err(err));
                return (true, done_rx);
            }
            gtxn.offsets_added_to_txn = true;
        }

        self.commit_txn(&mut gtxn, ctx, uncommitted, done_tx);
        (true, done_rx)
    }

    /// Tie the group's offsets topic into the transaction. Requires a
    /// producer id, initializing one if none was needed yet.
    async fn add_offsets_to_txn(&self, group: String) -> Result<()> {
        let (id, epoch) = self.producer_id().await?;
        let transactional_id = self.cfg.txn_id.clone().unwrap_or_default();
        info!(
            txn = %transactional_id,
            producer_id = id,
            producer_epoch = epoch,
            group = %group,
            "issuing AddOffsetsToTxn"
        );
        let req = AddOffsetsToTxnRequest {
            transactional_id,
            producer_id: id,
            producer_epoch: epoch,
            group,
        };
        let broker = Arc::clone(&self.txn_broker);
        let result = self
            .with_concurrent_txn("AddOffsetsToTxn", || {
                let fut = broker.add_offsets_to_txn(req.clone());
                async move {
                    match Error::from_wire(fut.await?) {
                        None => Ok(()),
                        Some(err) => Err(err),
                    }
                }
            })
            .await;

        if let Err(err) = &result {
            if err.kafka_code().is_some() && !err.is_retriable() {
                self.fail_producer_id(id, epoch, err.clone());
            }
        }
        result
    }

    /// Issue the TxnOffsetCommit on a task, respecting the one-in-flight
    /// slot.
    fn commit_txn(
        &self,
        gtxn: &mut GroupTxnState,
        ctx: &CancellationToken,
        uncommitted: OffsetMap,
        done_tx: oneshot::Sender<Result<TxnOffsetCommitResponse>>,
    ) {
        let Some(group) = self.group_consumer() else {
            let _ = done_tx.send(Err(Error::NotGroup));
            return;
        };

        // a newer commit supersedes whatever is in flight
        if let Some(prior_cancel) = gtxn.commit_cancel.take() {
            prior_cancel.cancel();
        }
        let prior_done = gtxn.commit_done.take();

        let commit_ctx = group.context().child_token();
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        gtxn.commit_cancel = Some(commit_ctx.clone());
        gtxn.commit_done = Some(finished_rx);

        // the caller's context feeds into the commit's cancellation
        {
            let caller = ctx.clone();
            let commit_ctx = commit_ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => commit_ctx.cancel(),
                    _ = commit_ctx.cancelled() => {}
                }
            });
        }

        // the id was set at the latest by AddOffsetsToTxn; issued even if
        // it has since failed, in which case the broker rejects it
        let current = self.producer.id.load_full();
        let member_id = group.member_id();
        let mut req = TxnOffsetCommitRequest {
            transactional_id: self.cfg.txn_id.clone().unwrap_or_default(),
            group: group.group(),
            producer_id: current.id,
            producer_epoch: current.epoch,
            generation: group.generation(),
            member_id: member_id.clone(),
            instance_id: group.instance_id(),
            topics: Vec::new(),
        };
        for (topic, partitions) in &uncommitted {
            let mut req_topic = TxnOffsetCommitReqTopic {
                topic: topic.clone(),
                partitions: Vec::new(),
            };
            for (partition, eo) in partitions {
                req_topic.partitions.push(TxnOffsetCommitReqPartition {
                    partition: *partition,
                    offset: eo.offset,
                    leader_epoch: eo.epoch,
                    metadata: Some(member_id.clone()),
                });
            }
            req.topics.push(req_topic);
        }

        let broker = Arc::clone(&self.txn_broker);
        tokio::spawn(async move {
            // dropping this releases the slot for the next commit
            let _finished_tx = finished_tx;
            if let Some(done) = prior_done {
                debug!("waiting for the prior txn offset commit to finish");
                let _ = done.await;
            }
            debug!(topics = req.topics.len(), "issuing txn offset commit");
            let result = broker.txn_offset_commit(req, &commit_ctx).await;
            let _ = done_tx.send(result);
        });
    }

    /// Run `f`, retrying while it fails with CONCURRENT_TRANSACTIONS and
    /// the wall clock since the first attempt is inside the retry window.
    /// The previous transaction is likely still finalizing on the broker.
    pub(crate) async fn with_concurrent_txn<T, F, Fut>(&self, name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut tries: u32 = 0;
        loop {
            let result = f().await;
            let concurrent = matches!(
                &result,
                Err(Error::Kafka(KafkaCode::ConcurrentTransactions))
            );
            if concurrent && start.elapsed() < CONCURRENT_TXN_RETRY_WINDOW {
                tries += 1;
                debug!(
                    op = name,
                    tries,
                    since_start_ms = start.elapsed().as_millis() as u64,
                    backoff_ms = self.cfg.txn_backoff.as_millis() as u64,
                    "request failed with CONCURRENT_TRANSACTIONS, backing off and retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.txn_backoff) => continue,
                    _ = self.shutdown.cancelled() => {
                        error!(op = name, "abandoning retry, client is shutting down");
                        return result;
                    }
                }
            }
            return result;
        }
    }
}
