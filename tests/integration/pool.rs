//! Pool behaviour end to end: recovery, timeouts, cancellation, disposal.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use cbkv::kv::{GetOptions, UpsertOptions};
use cbkv::net::{CancelToken, completion_channel};
use cbkv::proto::{KvRequest, Status};
use cbkv::{ErrorKind, KvConfig};

use crate::fixtures::Rig;

fn pool_config() -> KvConfig {
    KvConfig {
        num_kv_connections: 2,
        max_kv_connections: 5,
        ..KvConfig::default()
    }
}

#[test]
fn pool_heals_after_every_connection_dies() {
    let rig = Rig::new(1, 0, pool_config());
    let collection = rig.collection();

    collection
        .upsert("warm", &json!({"v": 1}), &UpsertOptions::default())
        .unwrap();

    rig.node(0).kill_connections();
    // let the read loops observe the hangup and mark their connections dead
    thread::sleep(Duration::from_millis(100));

    let workers: Vec<_> = (0..10)
        .map(|worker| {
            let collection = collection.clone();
            thread::spawn(move || {
                collection.upsert(
                    &format!("k{worker}"),
                    &json!({"v": worker}),
                    &UpsertOptions {
                        timeout: Some(Duration::from_secs(10)),
                        ..Default::default()
                    },
                )
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    let pool = rig.bucket.topology().unwrap().any_pool().unwrap();
    assert!(pool.live_count() >= 2, "pool must heal back to min_size");
    // recovery reconnected on top of the two originals
    assert!(rig.node(0).accepted() >= 4);
}

#[test]
fn stalled_server_times_out_and_recovers() {
    let rig = Rig::single();
    let collection = rig.collection();

    collection
        .upsert("k", &json!({"v": 1}), &UpsertOptions::default())
        .unwrap();

    rig.node(0).stall(true);
    let err = collection
        .get(
            "k",
            &GetOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // the late response is discarded and nothing leaks: the same
    // connection serves the next call
    rig.node(0).stall(false);
    let fetched = collection.get("k", &GetOptions::default()).unwrap();
    let value: serde_json::Value = fetched.content_as().unwrap();
    assert_eq!(value, json!({"v": 1}));
}

#[test]
fn cancellation_is_distinct_from_timeout() {
    let rig = Rig::single();
    let collection = rig.collection();

    collection
        .upsert("k", &json!({"v": 1}), &UpsertOptions::default())
        .unwrap();
    rig.node(0).stall(true);

    let cancel = CancelToken::new();
    let trip = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trip.cancel();
    });

    let err = collection
        .get(
            "k",
            &GetOptions {
                timeout: Some(Duration::from_secs(30)),
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    rig.node(0).stall(false);
}

#[test]
fn bucket_send_is_a_raw_entry_point() {
    let rig = Rig::single();
    let collection = rig.collection();
    collection
        .upsert("k", &json!({"v": 7}), &UpsertOptions::default())
        .unwrap();

    let (complete, receiver) = completion_channel();
    rig.bucket
        .send(KvRequest::get("k"), CancelToken::new(), complete)
        .unwrap();
    let response = receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), Status::Success);
    assert_ne!(response.cas(), 0);
}

#[test]
fn frozen_pool_keeps_its_shape() {
    let rig = Rig::new(1, 0, pool_config());
    let collection = rig.collection();
    collection
        .upsert("k", &json!({"v": 1}), &UpsertOptions::default())
        .unwrap();

    let pool = rig.bucket.topology().unwrap().any_pool().unwrap();
    let before = pool.live_count();
    assert!(before >= 1);

    let frozen = pool.freeze();
    assert_eq!(frozen.live_count(), before);

    let recovering = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.recover())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!recovering.is_finished(), "recovery must park behind freeze");
    assert_eq!(frozen.connection_count(), before);

    drop(frozen);
    recovering.join().unwrap();
}

#[test]
fn disposed_bucket_refuses_further_work() {
    let rig = Rig::single();
    let collection = rig.collection();
    collection
        .upsert("k", &json!({"v": 1}), &UpsertOptions::default())
        .unwrap();

    rig.bucket.dispose();
    let err = collection.get("k", &GetOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalOrRetryable);
}
