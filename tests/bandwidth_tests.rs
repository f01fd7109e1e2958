//! Bandwidth tests between real peers on loopback.

mod common;

use std::time::Duration;

use meshbench::proto::{BandwidthSpec, Message};
use meshbench::{bandwidth, group, orchestrate, ErrorKind};
use tokio_test::assert_ok;

const IDLE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_bandwidth_test() {
    let (responder, handle) = common::spawn_peer(IDLE).await;
    let initiator = common::new_peer().await;

    let spec = common::small_spec();
    let result = assert_ok!(bandwidth::test(&initiator, &responder, spec).await);

    assert!(result.elapsed_seconds > 0.0);
    let moved = result.bytes_per_second * result.elapsed_seconds;
    assert!((moved - spec.total_bytes().unwrap() as f64).abs() < 1.0, "moved {moved} bytes");

    assert_ok!(group::kill_sync(&initiator, &responder).await);
    assert!(handle.await.unwrap().is_done());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_rounds_are_reasked() {
    let (responder, handle) = common::spawn_peer(IDLE).await;
    let initiator = common::new_peer().await;

    let spec = BandwidthSpec {
        buffer_size: 0,
        message_size: 4 * 1024,
        message_count: 1,
        min_duration_ms: 50,
    };
    let result = assert_ok!(bandwidth::test(&initiator, &responder, spec).await);
    assert!(result.elapsed_seconds > 0.0);
    // Grown rounds move more than the first one asked for.
    assert!(result.bytes_per_second * result.elapsed_seconds > spec.total_bytes().unwrap() as f64);

    // The responder is back in its loop afterwards.
    assert_ok!(bandwidth::test(&initiator, &responder, common::small_spec()).await);

    group::kill_sync(&initiator, &responder).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orchestrated_bandwidth_test() {
    let (a, ha) = common::spawn_peer(IDLE).await;
    let (b, hb) = common::spawn_peer(IDLE).await;
    let controller = common::new_peer().await;

    let spec = common::small_spec();
    let result = assert_ok!(orchestrate::pairwise(&controller, &a, &b, spec).await);
    assert!(result.elapsed_seconds > 0.0);
    let moved = result.bytes_per_second * result.elapsed_seconds;
    assert!((moved - spec.total_bytes().unwrap() as f64).abs() < 1.0);

    for (addr, handle) in [(a, ha), (b, hb)] {
        group::kill_sync(&controller, &addr).await.unwrap();
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_unreachable_responder_is_connect_failure() {
    let initiator = common::new_peer().await;
    let dead = common::dead_address().await;
    let err = bandwidth::test(&initiator, &dead, common::small_spec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailure);
    assert!(!err.is_remote());
}

/// More bytes than a `u64` can count, in messages far over any size limit.
fn overflowing_spec() -> BandwidthSpec {
    BandwidthSpec {
        buffer_size: 0,
        message_size: u64::MAX / 2,
        message_count: 3,
        min_duration_ms: 0,
    }
}

#[tokio::test]
async fn test_oversized_spec_fails_before_connecting() {
    let initiator = common::new_peer().await;
    let dead = common::dead_address().await;
    let err = bandwidth::test(&initiator, &dead, overflowing_spec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(!err.is_remote());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responder_refuses_oversized_handshake() {
    let (responder, handle) = common::spawn_peer(IDLE).await;
    let initiator = common::new_peer().await;

    let socket = initiator.connect(&responder).await.unwrap();
    let handshake = Message::BwHandshake {
        port: 1,
        spec: overflowing_spec(),
    };
    let err = initiator
        .rpc_call(&socket, Duration::from_secs(5), handshake)
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.kind(), ErrorKind::Protocol);
    socket.close().await;

    // The responder is still serving.
    assert_ok!(bandwidth::test(&initiator, &responder, common::small_spec()).await);

    group::kill_sync(&initiator, &responder).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orchestrated_oversized_spec_is_remote_protocol_error() {
    let (a, ha) = common::spawn_peer(IDLE).await;
    let (b, hb) = common::spawn_peer(IDLE).await;
    let controller = common::new_peer().await;

    let err = bandwidth::request(&controller, &a, &b, overflowing_spec())
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.kind(), ErrorKind::Protocol);

    for (addr, handle) in [(a, ha), (b, hb)] {
        group::kill_sync(&controller, &addr).await.unwrap();
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orchestrated_failure_comes_back_as_remote_fault() {
    let (a, ha) = common::spawn_peer(IDLE).await;
    let dead = common::dead_address().await;
    let controller = common::new_peer().await;

    let err = bandwidth::request(&controller, &a, &dead, common::small_spec())
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.kind(), ErrorKind::ConnectFailure);
    match err {
        meshbench::Error::RemoteFault(fault) => assert_eq!(fault.origin, a),
        other => panic!("expected remote fault, got {other:?}"),
    }

    group::kill_sync(&controller, &a).await.unwrap();
    ha.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarded_fault_keeps_origin() {
    // B only speaks the group protocol, so it refuses the handshake.
    let mut b_peer = meshbench::Peer::bind(common::test_config()).await.unwrap();
    group::init(&mut b_peer).unwrap();
    let (b, hb) = common::run(b_peer, IDLE);
    let (a, ha) = common::spawn_peer(IDLE).await;
    let controller = common::new_peer().await;

    let err = bandwidth::request(&controller, &a, &b, common::small_spec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    match err {
        meshbench::Error::RemoteFault(fault) => {
            assert_eq!(fault.origin, b);
            assert!(fault.message.contains("BW handshake"), "{}", fault.message);
        }
        other => panic!("expected remote fault, got {other:?}"),
    }

    for (addr, handle) in [(a, ha), (b, hb)] {
        group::kill_sync(&controller, &addr).await.unwrap();
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_matrix_runs_every_ordered_pair() {
    let mut hosts = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let (addr, handle) = common::spawn_peer(IDLE).await;
        hosts.push(addr);
        handles.push(handle);
    }
    let controller = common::new_peer().await;

    let matrix = assert_ok!(orchestrate::matrix(&controller, &hosts, common::small_spec()).await);
    assert_eq!(matrix.len(), 3);
    let mut tests = 0;
    for (i, row) in matrix.iter().enumerate() {
        assert_eq!(row.len(), 3);
        for (j, cell) in row.iter().enumerate() {
            if i == j {
                assert!(cell.is_none(), "diagonal cell {i} is set");
            } else {
                assert!(cell.as_ref().unwrap().bytes_per_second > 0.0);
                tests += 1;
            }
        }
    }
    assert_eq!(tests, 3 * 2);

    for (addr, handle) in hosts.iter().zip(handles) {
        group::kill_sync(&controller, addr).await.unwrap();
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_matrix_aborts_on_first_failure() {
    let (a, ha) = common::spawn_peer(IDLE).await;
    let dead = common::dead_address().await;
    let controller = common::new_peer().await;

    let err = orchestrate::matrix(&controller, &[a.clone(), dead.clone()], common::small_spec())
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&dead.to_string()));

    group::kill_sync(&controller, &a).await.unwrap();
    ha.await.unwrap();
}
