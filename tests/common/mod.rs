//! Scripted in-memory collaborators for driving the coordination core in
//! tests.
//!
//! Each mock answers from a queue of scripted responses and falls back to
//! a benign default when the queue runs dry, while recording every request
//! it saw so tests can assert on ordering and timing.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kavka::client::{
    AddOffsetsToTxnRequest, Client, ClientConfig, Collaborators, EndTxnRequest, EpochOffset,
    GroupConsumer, GroupTransactSession, HeartbeatReply, InitProducerIdRequest,
    InitProducerIdResponse, MetadataBroker, MetadataFetcher, MetadataPartition, MetadataResponse,
    MetadataTopic, OffsetMap, ProducerDriver, TxnBroker, TxnOffsetCommitRequest,
    TxnOffsetCommitRespPartition, TxnOffsetCommitRespTopic, TxnOffsetCommitResponse,
};
use kavka::error::{Error, Result};

// ============================================================================
// Metadata fetcher
// ============================================================================

pub struct MockFetcher {
    queue: Mutex<VecDeque<Result<MetadataResponse>>>,
    fallback: Mutex<MetadataResponse>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<Instant>>,
    all_flags: Mutex<Vec<bool>>,
}

impl MockFetcher {
    pub fn new(fallback: MetadataResponse) -> Arc<MockFetcher> {
        Arc::new(MockFetcher {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            all_flags: Mutex::new(Vec::new()),
        })
    }

    /// Delay every fetch by `delay`, simulating a stalled broker.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Queue one response ahead of the fallback.
    pub fn push(&self, response: Result<MetadataResponse>) {
        self.queue.lock().unwrap().push_back(response);
    }

    /// Replace the response served when the queue is empty.
    pub fn set_fallback(&self, response: MetadataResponse) {
        *self.fallback.lock().unwrap() = response;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    pub fn all_flags(&self) -> Vec<bool> {
        self.all_flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataFetcher for MockFetcher {
    async fn fetch_metadata(
        &self,
        all_topics: bool,
        _topics: &[String],
    ) -> Result<MetadataResponse> {
        self.calls.lock().unwrap().push(Instant::now());
        self.all_flags.lock().unwrap().push(all_topics);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.queue.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}

// ============================================================================
// Producer driver
// ============================================================================

#[derive(Default)]
pub struct MockDriver {
    pub flushes: AtomicUsize,
    pub aborts: AtomicUsize,
    fail_next: Mutex<Option<Error>>,
}

impl MockDriver {
    pub fn new() -> Arc<MockDriver> {
        Arc::new(MockDriver::default())
    }

    /// Fail the next flush or abort with `err`.
    pub fn fail_next(&self, err: Error) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_failure(&self) -> Result<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProducerDriver for MockDriver {
    async fn flush(&self, _ctx: &CancellationToken) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.take_failure()
    }

    async fn abort_buffered_records(&self, _ctx: &CancellationToken) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.take_failure()
    }
}

// ============================================================================
// Transactional broker
// ============================================================================

/// Scripted behavior for one TxnOffsetCommit call.
pub enum CommitBehavior {
    Respond(Result<TxnOffsetCommitResponse>),
    /// Park until the commit's context cancels, then fail with Cancelled.
    HangUntilCancelled,
}

pub struct MockTxnBroker {
    init_queue: Mutex<VecDeque<Result<InitProducerIdResponse>>>,
    add_offsets_queue: Mutex<VecDeque<i16>>,
    commit_queue: Mutex<VecDeque<CommitBehavior>>,
    end_queue: Mutex<VecDeque<i16>>,
    pub events: Mutex<Vec<String>>,
    pub init_reqs: Mutex<Vec<InitProducerIdRequest>>,
    pub end_reqs: Mutex<Vec<EndTxnRequest>>,
    pub end_times: Mutex<Vec<Instant>>,
    pub commit_reqs: Mutex<Vec<TxnOffsetCommitRequest>>,
}

impl MockTxnBroker {
    pub fn new() -> Arc<MockTxnBroker> {
        Arc::new(MockTxnBroker {
            init_queue: Mutex::new(VecDeque::new()),
            add_offsets_queue: Mutex::new(VecDeque::new()),
            commit_queue: Mutex::new(VecDeque::new()),
            end_queue: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            init_reqs: Mutex::new(Vec::new()),
            end_reqs: Mutex::new(Vec::new()),
            end_times: Mutex::new(Vec::new()),
            commit_reqs: Mutex::new(Vec::new()),
        })
    }

    pub fn push_init(&self, response: Result<InitProducerIdResponse>) {
        self.init_queue.lock().unwrap().push_back(response);
    }

    pub fn push_init_code(&self, error_code: i16) {
        self.push_init(Ok(InitProducerIdResponse {
            error_code,
            producer_id: -1,
            producer_epoch: -1,
        }));
    }

    pub fn push_add_offsets_code(&self, error_code: i16) {
        self.add_offsets_queue.lock().unwrap().push_back(error_code);
    }

    pub fn push_commit(&self, behavior: CommitBehavior) {
        self.commit_queue.lock().unwrap().push_back(behavior);
    }

    /// Queue a commit response failing `partition` of `topic` with
    /// `error_code` and succeeding everything else.
    pub fn push_commit_partition_error(&self, topic: &str, partition: i32, error_code: i16) {
        self.push_commit(CommitBehavior::Respond(Ok(TxnOffsetCommitResponse {
            version: 3,
            topics: vec![TxnOffsetCommitRespTopic {
                topic: topic.to_string(),
                partitions: vec![TxnOffsetCommitRespPartition {
                    partition,
                    error_code,
                }],
            }],
        })))
    }

    pub fn push_end_code(&self, error_code: i16) {
        self.end_queue.lock().unwrap().push_back(error_code);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn end_requests(&self) -> Vec<EndTxnRequest> {
        self.end_reqs.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_reqs.lock().unwrap().len()
    }

    fn echo_success(req: &TxnOffsetCommitRequest) -> TxnOffsetCommitResponse {
        TxnOffsetCommitResponse {
            version: 3,
            topics: req
                .topics
                .iter()
                .map(|t| TxnOffsetCommitRespTopic {
                    topic: t.topic.clone(),
                    partitions: t
                        .partitions
                        .iter()
                        .map(|p| TxnOffsetCommitRespPartition {
                            partition: p.partition,
                            error_code: 0,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl TxnBroker for MockTxnBroker {
    async fn init_producer_id(&self, req: InitProducerIdRequest) -> Result<InitProducerIdResponse> {
        self.events.lock().unwrap().push("InitProducerId".to_string());
        self.init_reqs.lock().unwrap().push(req);
        match self.init_queue.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(InitProducerIdResponse {
                error_code: 0,
                producer_id: 1000,
                producer_epoch: 1,
            }),
        }
    }

    async fn add_offsets_to_txn(&self, _req: AddOffsetsToTxnRequest) -> Result<i16> {
        self.events
            .lock()
            .unwrap()
            .push("AddOffsetsToTxn".to_string());
        Ok(self.add_offsets_queue.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn txn_offset_commit(
        &self,
        req: TxnOffsetCommitRequest,
        ctx: &CancellationToken,
    ) -> Result<TxnOffsetCommitResponse> {
        self.events
            .lock()
            .unwrap()
            .push("TxnOffsetCommit".to_string());
        let behavior = self.commit_queue.lock().unwrap().pop_front();
        let result = match behavior {
            None => Ok(Self::echo_success(&req)),
            Some(CommitBehavior::Respond(response)) => response,
            Some(CommitBehavior::HangUntilCancelled) => {
                ctx.cancelled().await;
                self.events
                    .lock()
                    .unwrap()
                    .push("TxnOffsetCommit cancelled".to_string());
                Err(Error::Cancelled)
            }
        };
        self.commit_reqs.lock().unwrap().push(req);
        result
    }

    async fn end_txn(&self, req: EndTxnRequest) -> Result<i16> {
        self.events
            .lock()
            .unwrap()
            .push(format!("EndTxn commit={}", req.commit));
        self.end_times.lock().unwrap().push(Instant::now());
        self.end_reqs.lock().unwrap().push(req);
        Ok(self.end_queue.lock().unwrap().pop_front().unwrap_or(0))
    }
}

// ============================================================================
// Group consumer
// ============================================================================

pub struct MockGroup {
    name: String,
    generation: i32,
    member_id: String,
    committed: Mutex<OffsetMap>,
    uncommitted: Mutex<OffsetMap>,
    pub set_calls: Mutex<Vec<(OffsetMap, bool)>>,
    hb_tx: mpsc::Sender<HeartbeatReply>,
    hb_results: Arc<Mutex<VecDeque<Result<()>>>>,
    ctx: CancellationToken,
}

impl MockGroup {
    /// Build a group whose heartbeat loop answers every forced heartbeat
    /// from a scripted queue, defaulting to success.
    pub fn spawn(name: &str) -> Arc<MockGroup> {
        let (hb_tx, mut hb_rx) = mpsc::channel::<HeartbeatReply>(8);
        let hb_results: Arc<Mutex<VecDeque<Result<()>>>> = Arc::new(Mutex::new(VecDeque::new()));
        {
            let hb_results = Arc::clone(&hb_results);
            tokio::spawn(async move {
                while let Some(reply) = hb_rx.recv().await {
                    let result = hb_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
                    let _ = reply.send(result);
                }
            });
        }
        Arc::new(MockGroup {
            name: name.to_string(),
            generation: 5,
            member_id: "member-1".to_string(),
            committed: Mutex::new(OffsetMap::new()),
            uncommitted: Mutex::new(OffsetMap::new()),
            set_calls: Mutex::new(Vec::new()),
            hb_tx,
            hb_results,
            ctx: CancellationToken::new(),
        })
    }

    pub fn set_committed(&self, offsets: OffsetMap) {
        *self.committed.lock().unwrap() = offsets;
    }

    pub fn set_uncommitted(&self, offsets: OffsetMap) {
        *self.uncommitted.lock().unwrap() = offsets;
    }

    /// Script the result of the next forced heartbeat.
    pub fn push_heartbeat(&self, result: Result<()>) {
        self.hb_results.lock().unwrap().push_back(result);
    }

    pub fn set_offset_calls(&self) -> Vec<(OffsetMap, bool)> {
        self.set_calls.lock().unwrap().clone()
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl GroupConsumer for MockGroup {
    fn group(&self) -> String {
        self.name.clone()
    }

    fn generation(&self) -> i32 {
        self.generation
    }

    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn instance_id(&self) -> Option<String> {
        None
    }

    fn committed_offsets(&self) -> OffsetMap {
        self.committed.lock().unwrap().clone()
    }

    fn uncommitted_offsets(&self) -> OffsetMap {
        self.uncommitted.lock().unwrap().clone()
    }

    fn set_offsets(&self, offsets: OffsetMap, from_reset: bool) {
        self.set_calls.lock().unwrap().push((offsets.clone(), from_reset));
        *self.committed.lock().unwrap() = offsets;
    }

    fn heartbeat_force(&self) -> mpsc::Sender<HeartbeatReply> {
        self.hb_tx.clone()
    }

    fn context(&self) -> CancellationToken {
        self.ctx.clone()
    }
}

// ============================================================================
// Response and client builders
// ============================================================================

pub fn partition_meta(partition: i32, leader: i32, leader_epoch: i32) -> MetadataPartition {
    MetadataPartition {
        partition,
        error_code: 0,
        leader,
        leader_epoch,
    }
}

pub fn topic_meta(topic: &str, partitions: Vec<MetadataPartition>) -> MetadataTopic {
    MetadataTopic {
        topic: topic.to_string(),
        error_code: 0,
        is_internal: false,
        partitions,
    }
}

pub fn meta_response(brokers: &[i32], topics: Vec<MetadataTopic>) -> MetadataResponse {
    MetadataResponse {
        version: 9,
        brokers: brokers
            .iter()
            .map(|id| MetadataBroker {
                node_id: *id,
                host: format!("broker-{id}.local"),
                port: 9092,
            })
            .collect(),
        topics,
    }
}

pub fn offsets(entries: &[(&str, i32, i64, i32)]) -> OffsetMap {
    let mut map = OffsetMap::new();
    for (topic, partition, offset, epoch) in entries {
        map.entry(topic.to_string()).or_default().insert(
            *partition,
            EpochOffset {
                offset: *offset,
                epoch: *epoch,
            },
        );
    }
    map
}

/// A config tuned for fast tests.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        metadata_max_age: Duration::from_secs(60),
        metadata_min_age: Duration::from_millis(10),
        retry_backoff: Arc::new(|_| Duration::from_millis(10)),
        ..Default::default()
    }
}

pub struct TestCluster {
    pub client: Arc<Client>,
    pub fetcher: Arc<MockFetcher>,
    pub driver: Arc<MockDriver>,
    pub broker: Arc<MockTxnBroker>,
    pub group: Option<Arc<MockGroup>>,
}

impl TestCluster {
    /// Load metadata for `topic` and return partition 0's record buffer.
    pub async fn load_topic(&self, topic: &str) -> Arc<kavka::client::RecordBuffer> {
        self.client.track_topics([topic]);
        assert!(
            self.client
                .wait_metadata(&CancellationToken::new(), Duration::from_secs(5))
                .await,
            "metadata for {topic} loaded"
        );
        let tp = self.client.topics().get(topic).expect("topic tracked");
        let entry = tp.load().all.get(&0).cloned().expect("partition 0");
        Arc::clone(&entry.records)
    }

    /// Pretend the produce pump wrote through partition 0 of `topic`
    /// within the open transaction.
    pub async fn mark_produced(&self, topic: &str) {
        self.load_topic(topic).await.mark_added_to_txn();
    }
}

/// Build a plain client over the mocks.
pub fn plain_cluster(cfg: ClientConfig, fallback: MetadataResponse) -> TestCluster {
    let fetcher = MockFetcher::new(fallback);
    let driver = MockDriver::new();
    let broker = MockTxnBroker::new();
    let client = Client::new(
        cfg,
        Collaborators {
            fetcher: Arc::clone(&fetcher) as Arc<dyn MetadataFetcher>,
            producer: Arc::clone(&driver) as Arc<dyn ProducerDriver>,
            txn: Arc::clone(&broker) as Arc<dyn TxnBroker>,
            group: None,
        },
    )
    .expect("client");
    TestCluster {
        client,
        fetcher,
        driver,
        broker,
        group: None,
    }
}

/// Build a transactional, group-consuming client over the mocks.
pub fn txn_cluster(mut cfg: ClientConfig) -> (TestCluster, GroupTransactSession) {
    cfg.txn_id = Some("etl".to_string());
    cfg.group = Some("workers".to_string());

    let fetcher = MockFetcher::new(meta_response(
        &[1],
        vec![topic_meta("events", vec![partition_meta(0, 1, 1)])],
    ));
    let driver = MockDriver::new();
    let broker = MockTxnBroker::new();
    let group = MockGroup::spawn("workers");
    let client = Client::new(
        cfg,
        Collaborators {
            fetcher: Arc::clone(&fetcher) as Arc<dyn MetadataFetcher>,
            producer: Arc::clone(&driver) as Arc<dyn ProducerDriver>,
            txn: Arc::clone(&broker) as Arc<dyn TxnBroker>,
            group: Some(Arc::clone(&group) as Arc<dyn GroupConsumer>),
        },
    )
    .expect("client");
    let session = GroupTransactSession::new(Arc::clone(&client)).expect("session");
    (
        TestCluster {
            client,
            fetcher,
            driver,
            broker,
            group: Some(group),
        },
        session,
    )
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
