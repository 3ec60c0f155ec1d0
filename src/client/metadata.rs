//! Metadata freshness waiting, the refresh loop, and the refresh itself.
//!
//! Refreshes are requested through two capacity-one channels: a soft
//! trigger ("refresh when appropriate", honoring the configured minimum
//! age) and a hard trigger ("refresh now"). Sends never block; a full
//! channel means a refresh is already pending. A ticker at the configured
//! maximum age keeps metadata from going stale with no triggers at all.
//!
//! A hard trigger is served after a short coalescing pause so that a burst
//! of triggers costs one request, and is retried back-to-back a bounded
//! number of times when the refresh reports it needs another attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broker::BrokerHandle;
use super::core::Client;
use super::cursor::ConsumptionCursor;
use super::record::RecordBuffer;
use super::topics::{merge_topic_partitions, NewTopicData, PartitionEntry};
use crate::constants::{
    EPOCH_UNSET, FRESH_METADATA_AGE, METADATA_NOW_COALESCE, METADATA_NOW_MAX_TRIES,
};
use crate::error::{Error, Result};

/// Freshness monitor: the timestamp of the last refresh plus a broadcast
/// for waiters.
pub(crate) struct MetaWait {
    last_update: std::sync::Mutex<Option<Instant>>,
    notify: Notify,
}

impl MetaWait {
    pub(crate) fn new() -> MetaWait {
        MetaWait {
            last_update: std::sync::Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Stamp now as the last update and wake every waiter.
    pub(crate) fn signal(&self) {
        *self.last_update.lock().unwrap() = Some(Instant::now());
        self.notify.notify_waiters();
    }

    pub(crate) fn last_update(&self) -> Option<Instant> {
        *self.last_update.lock().unwrap()
    }
}

impl Client {
    /// Request an eventual metadata refresh. The refresh loop honors the
    /// configured minimum metadata age before serving it.
    pub fn trigger_update_metadata(&self) {
        let _ = self.update_tx.try_send(());
    }

    /// Request an immediate metadata refresh, bypassing the minimum-age
    /// floor.
    pub fn trigger_update_metadata_now(&self) {
        let _ = self.update_now_tx.try_send(());
    }

    /// Wait for metadata at most `timeout`.
    ///
    /// Returns immediately when metadata was refreshed within the last
    /// second. Otherwise triggers an immediate refresh and waits for the
    /// next refresh to complete, the timeout to expire, the caller's
    /// context to cancel, or the client to shut down. Returns whether a
    /// refresh newer than the call's entry was observed.
    pub async fn wait_metadata(&self, ctx: &CancellationToken, timeout: Duration) -> bool {
        let entry = Instant::now();
        if let Some(last) = self.metawait.last_update() {
            if entry.saturating_duration_since(last) < FRESH_METADATA_AGE {
                return true;
            }
        }

        self.trigger_update_metadata_now();

        let deadline = entry + timeout;
        loop {
            // arm before re-checking so a signal between the check and the
            // await is not lost
            let notified = self.metawait.notify.notified();
            if let Some(last) = self.metawait.last_update() {
                if last > entry {
                    return true;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = ctx.cancelled() => return false,
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// The long-running refresh loop. Exits on client shutdown.
    pub(crate) async fn metadata_loop(
        self: Arc<Self>,
        mut soft_rx: mpsc::Receiver<()>,
        mut now_rx: mpsc::Receiver<()>,
    ) {
        let mut consecutive_errors: u32 = 0;
        let mut last_at: Option<Instant> = None;

        let period = self.cfg.metadata_max_age;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut now = false;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
                _ = soft_rx.recv() => {}
                _ = now_rx.recv() => now = true,
            }

            let mut now_tries: u32 = 0;
            loop {
                now_tries += 1;
                if !now {
                    let since_last = last_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if let Some(wait) = self.cfg.metadata_min_age.checked_sub(since_last) {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = now_rx.recv() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                } else {
                    // an immediate trigger tends to arrive in bursts; give
                    // the stragglers a moment to land in the channel
                    tokio::time::sleep(METADATA_NOW_COALESCE).await;
                }

                // collapse whatever fired while we waited into this pass
                let _ = soft_rx.try_recv();
                let _ = now_rx.try_recv();

                let result = self.update_metadata().await;
                if matches!(&result, Ok(true)) || result.is_err() {
                    if now && now_tries < METADATA_NOW_MAX_TRIES {
                        continue;
                    }
                    self.trigger_update_metadata();
                }
                match result {
                    Ok(_) => {
                        last_at = Some(Instant::now());
                        consecutive_errors = 0;
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        let backoff = (self.cfg.retry_backoff)(consecutive_errors);
                        warn!(
                            %err,
                            consecutive_errors,
                            backoff_ms = backoff.as_millis() as u64,
                            "metadata refresh failed, backing off"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
                break;
            }
        }
    }

    /// Refresh metadata for every tracked topic, merging the results into
    /// the published snapshots. Returns whether another refresh should be
    /// scheduled because something transient failed.
    pub(crate) async fn update_metadata(&self) -> Result<bool> {
        let result = self.update_metadata_inner().await;
        // waiters learn about failed refreshes too; their freshness check
        // is against the attempt, not its outcome
        self.metawait.signal();
        result
    }

    async fn update_metadata_inner(&self) -> Result<bool> {
        let to_update = self.topics.tracked();
        let (mut fresh, all) = self.fetch_topic_metadata(&to_update).await?;

        // A regex subscription fetches every topic, so the response may
        // name topics we are not yet tracking; start tracking them so the
        // merge below can record their state.
        if all {
            self.topics.ensure_topics(fresh.keys().map(String::as_str).collect::<Vec<_>>());
        }

        let mut needs_retry = false;
        let topics = self.topics.load();
        for (topic, tp) in topics.iter() {
            if let Some(data) = fresh.remove(topic) {
                needs_retry |= merge_topic_partitions(tp, data, &self.consumer);
            }
        }

        self.consumer.do_on_metadata_update();
        Ok(needs_retry)
    }

    /// Fetch metadata for `req_topics` and shape it into per-topic
    /// unpublished state, resolving each partition's leader against the
    /// known brokers.
    async fn fetch_topic_metadata(
        &self,
        req_topics: &[String],
    ) -> Result<(HashMap<String, NewTopicData>, bool)> {
        let all = self.cfg.regex_topics;
        let meta = self.fetcher.fetch_metadata(all, req_topics).await?;
        debug!(
            topics = meta.topics.len(),
            brokers = meta.brokers.len(),
            version = meta.version,
            all,
            "fetched metadata"
        );

        for broker in &meta.brokers {
            self.brokers
                .entry(broker.node_id)
                .or_insert_with(|| BrokerHandle::new(broker.node_id));
        }

        let mut topics = HashMap::with_capacity(meta.topics.len());
        for topic_meta in meta.topics {
            let mut parts = NewTopicData {
                load_err: Error::from_wire(topic_meta.error_code),
                is_internal: topic_meta.is_internal,
                ..Default::default()
            };
            if parts.load_err.is_some() {
                topics.insert(topic_meta.topic, parts);
                continue;
            }

            for pm in &topic_meta.partitions {
                let leader_epoch = if meta.version < 7 {
                    EPOCH_UNSET
                } else {
                    pm.leader_epoch
                };

                let records = Arc::new(RecordBuffer::new(
                    &topic_meta.topic,
                    pm.partition,
                    self.cfg.linger,
                    self.cfg.record_retries,
                ));
                let cursor = Arc::new(ConsumptionCursor::new(
                    &topic_meta.topic,
                    pm.partition,
                    leader_epoch,
                ));

                let mut load_err = Error::from_wire(pm.error_code);
                match self.brokers.get(&pm.leader) {
                    Some(handle) => {
                        records.set_sink(&handle.sink);
                        cursor.set_source(&handle.source);
                    }
                    None => {
                        if load_err.is_none() {
                            load_err = Some(Error::UnknownBrokerForPartition {
                                topic: topic_meta.topic.clone(),
                                partition: pm.partition,
                                broker: pm.leader,
                            });
                        }
                    }
                }

                parts.partitions.push(pm.partition);
                if load_err.is_none() {
                    parts.writable_partitions.push(pm.partition);
                }
                parts.entries.insert(
                    pm.partition,
                    PartitionEntry {
                        load_err,
                        leader: pm.leader,
                        leader_epoch,
                        records,
                        cursor,
                    },
                );
            }
            topics.insert(topic_meta.topic, parts);
        }

        Ok((topics, all))
    }
}
