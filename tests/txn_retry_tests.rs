//! Producer id initialization and recovery, and the bounded retry
//! envelope around CONCURRENT_TRANSACTIONS.

mod common;

use std::time::Duration;

use common::*;
use kavka::client::{ClientConfig, TransactionEnd};
use kavka::error::{Error, KafkaCode};
use tokio_util::sync::CancellationToken;

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn producer_id_initializes_once() {
    let (cluster, _session) = txn_cluster(test_config());

    let (id, epoch) = cluster.client.producer_id().await.unwrap();
    assert_eq!((id, epoch), (1000, 1));
    assert_eq!(cluster.broker.init_count(), 1);

    // cached afterwards
    let (id, epoch) = cluster.client.producer_id().await.unwrap();
    assert_eq!((id, epoch), (1000, 1));
    assert_eq!(cluster.broker.init_count(), 1);

    cluster.client.close().await;
}

#[tokio::test]
async fn fatal_init_error_sticks() {
    let (cluster, _session) = txn_cluster(test_config());
    cluster
        .broker
        .push_init_code(KafkaCode::TransactionalIdAuthorizationFailed as i16);

    let err = cluster.client.producer_id().await.unwrap_err();
    assert_eq!(
        err,
        Error::Kafka(KafkaCode::TransactionalIdAuthorizationFailed)
    );

    // fatal: no further wire attempts
    let err = cluster.client.producer_id().await.unwrap_err();
    assert_eq!(
        err,
        Error::Kafka(KafkaCode::TransactionalIdAuthorizationFailed)
    );
    assert_eq!(cluster.broker.init_count(), 1);

    cluster.client.close().await;
}

#[tokio::test]
async fn retriable_init_error_stays_reloadable() {
    let (cluster, _session) = txn_cluster(test_config());
    cluster
        .broker
        .push_init_code(KafkaCode::CoordinatorNotAvailable as i16);

    let err = cluster.client.producer_id().await.unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::CoordinatorNotAvailable));

    // the id stayed reload-pending, so the next request tries again and
    // succeeds off the default response
    let (id, epoch) = cluster.client.producer_id().await.unwrap();
    assert_eq!((id, epoch), (1000, 1));
    assert_eq!(cluster.broker.init_count(), 2);

    cluster.client.close().await;
}

#[tokio::test]
async fn epoch_fencing_recovers_on_next_begin() {
    let (cluster, session) = txn_cluster(test_config());
    let group = cluster.group.as_ref().unwrap();
    group.set_uncommitted(offsets(&[("events", 0, 42, 1)]));

    session.begin().await.unwrap();
    cluster
        .broker
        .push_end_code(KafkaCode::InvalidProducerEpoch as i16);

    // EndTxn fails fatally and the producer id is failed with it
    let err = session.end(&ctx(), TransactionEnd::Commit).await.unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::InvalidProducerEpoch));

    // with id_version 4 the epoch error is recoverable (KIP-588): begin
    // flips the id into the reload state instead of failing
    session.begin().await.unwrap();

    // the next id request performs the reload
    cluster.client.producer_id().await.unwrap();
    assert_eq!(cluster.broker.init_count(), 2);

    let init_reqs = cluster.broker.init_reqs.lock().unwrap();
    // the reload carries the old identity for the epoch bump
    assert_eq!(init_reqs[1].current_id, 1000);
    assert_eq!(init_reqs[1].current_epoch, 1);
    drop(init_reqs);

    session.close().await;
}

#[tokio::test]
async fn old_id_version_makes_epoch_fencing_fatal() {
    let cfg = ClientConfig {
        id_version: 3,
        ..test_config()
    };
    let (cluster, session) = txn_cluster(cfg);
    let group = cluster.group.as_ref().unwrap();
    group.set_uncommitted(offsets(&[("events", 0, 42, 1)]));

    session.begin().await.unwrap();
    cluster
        .broker
        .push_end_code(KafkaCode::InvalidProducerEpoch as i16);
    let err = session.end(&ctx(), TransactionEnd::Commit).await.unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::InvalidProducerEpoch));

    // version 3 has no KIP-588 epoch bumping; begin cannot recover
    let err = session.begin().await.unwrap_err();
    assert!(matches!(err, Error::FatalProducerId(_)));
    assert_eq!(cluster.broker.init_count(), 1);

    session.close().await;
}

#[tokio::test]
async fn unknown_producer_id_recovers_under_kip360() {
    let cfg = ClientConfig {
        id_version: 3,
        ..test_config()
    };
    let (cluster, session) = txn_cluster(cfg);
    let group = cluster.group.as_ref().unwrap();
    group.set_uncommitted(offsets(&[("events", 0, 42, 1)]));

    session.begin().await.unwrap();
    cluster
        .broker
        .push_end_code(KafkaCode::UnknownProducerId as i16);
    let err = session.end(&ctx(), TransactionEnd::Commit).await.unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::UnknownProducerId));

    session.begin().await.unwrap();
    cluster.client.producer_id().await.unwrap();
    assert_eq!(cluster.broker.init_count(), 2);

    session.close().await;
}

#[tokio::test]
async fn concurrent_transactions_retry_until_success() {
    let cfg = ClientConfig {
        txn_backoff: Duration::from_millis(400),
        ..test_config()
    };
    let (cluster, session) = txn_cluster(cfg);
    let group = cluster.group.as_ref().unwrap();
    group.set_uncommitted(offsets(&[("events", 0, 42, 1)]));

    for _ in 0..3 {
        cluster
            .broker
            .push_end_code(KafkaCode::ConcurrentTransactions as i16);
    }

    session.begin().await.unwrap();
    let started = tokio::time::Instant::now();
    let committed = session.end(&ctx(), TransactionEnd::Commit).await.unwrap();

    // three backoffs of 400ms, then the fourth attempt lands
    assert!(committed);
    assert_eq!(cluster.broker.end_times.lock().unwrap().len(), 4);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1100),
        "retries finished after {}ms",
        elapsed.as_millis()
    );

    session.close().await;
}

#[tokio::test]
async fn concurrent_transactions_give_up_after_the_window() {
    let cfg = ClientConfig {
        txn_backoff: Duration::from_millis(400),
        ..test_config()
    };
    let (cluster, session) = txn_cluster(cfg);
    let group = cluster.group.as_ref().unwrap();
    group.set_uncommitted(offsets(&[("events", 0, 42, 1)]));

    // every attempt collides; the envelope must stop at the window
    for _ in 0..64 {
        cluster
            .broker
            .push_end_code(KafkaCode::ConcurrentTransactions as i16);
    }

    session.begin().await.unwrap();
    let started = tokio::time::Instant::now();
    let err = session.end(&ctx(), TransactionEnd::Commit).await.unwrap_err();

    assert_eq!(err, Error::Kafka(KafkaCode::ConcurrentTransactions));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(5),
        "gave up after only {}ms",
        elapsed.as_millis()
    );
    assert!(
        elapsed < Duration::from_secs(8),
        "kept retrying too long: {}ms",
        elapsed.as_millis()
    );

    session.close().await;
}
