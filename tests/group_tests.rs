//! Group directory lifecycle over real control sockets.

mod common;

use std::time::Duration;

use meshbench::{group, ErrorKind};
use tokio_test::{assert_err, assert_ok};

const IDLE: Duration = Duration::from_secs(5);

/// A controller hosting an empty group `name`, dispatching in a task.
async fn directory(
    name: &str,
) -> (meshbench::PeerAddress, tokio::task::JoinHandle<meshbench::Peer>) {
    let mut peer = common::new_peer().await;
    group::create_group(&mut peer, name).unwrap();
    common::run(peer, IDLE)
}

#[tokio::test]
async fn test_explicit_rank_conflict_over_rpc() {
    let (dir, handle) = directory("bw").await;
    let first = common::new_peer().await;
    let second = common::new_peer().await;

    let s1 = first.connect(&dir).await.unwrap();
    let s2 = second.connect(&dir).await.unwrap();

    assert_eq!(group::join(&first, &s1, "bw", Some(0)).await.unwrap(), 0);
    let err = group::join(&second, &s2, "bw", Some(0)).await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // Same address and rank again is fine.
    assert_eq!(group::join(&first, &s1, "bw", Some(0)).await.unwrap(), 0);

    let snapshot = group::get(&first, &s1, "bw").await.unwrap();
    assert_eq!(snapshot.addresses(), vec![first.address().clone()]);

    s1.close().await;
    s2.close().await;
    group::kill_sync(&first, &dir).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_join_at_highest_rank() {
    let (dir, handle) = directory("bw").await;
    let far = common::new_peer().await;
    let near = common::new_peer().await;
    let sf = far.connect(&dir).await.unwrap();
    let sn = near.connect(&dir).await.unwrap();

    assert_eq!(group::join(&far, &sf, "bw", Some(u32::MAX)).await.unwrap(), u32::MAX);
    assert_eq!(group::join(&near, &sn, "bw", None).await.unwrap(), 0);
    let snapshot = group::get(&near, &sn, "bw").await.unwrap();
    let ranks: Vec<u32> = snapshot.members.iter().map(|m| m.rank).collect();
    assert_eq!(ranks, vec![0, u32::MAX]);

    sf.close().await;
    sn.close().await;
    group::kill_sync(&far, &dir).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_join_leave_get() {
    let (dir, handle) = directory("bw").await;
    let a = common::new_peer().await;
    let b = common::new_peer().await;
    let sa = a.connect(&dir).await.unwrap();
    let sb = b.connect(&dir).await.unwrap();

    assert_eq!(group::join(&a, &sa, "bw", None).await.unwrap(), 0);
    assert_eq!(group::join(&b, &sb, "bw", None).await.unwrap(), 1);
    let snapshot = group::get(&a, &sa, "bw").await.unwrap();
    assert_eq!(snapshot.name, "bw");
    assert_eq!(snapshot.addresses(), vec![a.address().clone(), b.address().clone()]);

    assert_ok!(group::leave(&a, &sa, "bw").await);
    // Leaving twice is a no-op.
    assert_ok!(group::leave(&a, &sa, "bw").await);
    let snapshot = group::get(&b, &sb, "bw").await.unwrap();
    assert_eq!(snapshot.members.len(), 1);
    assert_eq!(snapshot.members[0].rank, 1);

    let err = assert_err!(group::leave(&a, &sa, "nope").await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = assert_err!(group::join(&a, &sa, "nope", None).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = assert_err!(group::get(&a, &sa, "nope").await);
    assert_eq!(err.kind(), ErrorKind::NotFound);

    sa.close().await;
    sb.close().await;
    group::kill_sync(&a, &dir).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_kills_every_member() {
    let (dir, dir_handle) = directory("bw").await;

    let mut members = Vec::new();
    for _ in 0..3 {
        let peer = common::new_peer().await;
        let socket = peer.connect(&dir).await.unwrap();
        group::join(&peer, &socket, "bw", None).await.unwrap();
        socket.close().await;
        members.push(common::run(peer, Duration::from_secs(30)));
    }

    let client = common::new_peer().await;
    let socket = client.connect(&dir).await.unwrap();
    assert_ok!(group::shutdown(&client, &socket, "bw").await);

    for (_, handle) in members {
        let member = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("member mainloop did not end")
            .unwrap();
        assert!(member.is_done());
    }

    let err = group::get(&client, &socket, "bw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = group::shutdown(&client, &socket, "bw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    socket.close().await;
    group::kill_sync(&client, &dir).await.unwrap();
    assert!(dir_handle.await.unwrap().is_done());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_members() {
    let mut host = common::new_peer().await;
    group::create_group(&mut host, "bw").unwrap();
    let dir = host.address().clone();

    let joiners = tokio::spawn(async move {
        let mut peers = Vec::new();
        for rank in [2, 0] {
            let peer = common::new_peer().await;
            let socket = peer.connect(&dir).await.unwrap();
            group::join(&peer, &socket, "bw", Some(rank)).await.unwrap();
            socket.close().await;
            peers.push(peer);
        }
        peers
    });

    let snapshot = group::await_members(&mut host, "bw", 2, Duration::from_secs(5))
        .await
        .unwrap();
    let ranks: Vec<u32> = snapshot.members.iter().map(|m| m.rank).collect();
    assert_eq!(ranks, vec![0, 2]);
    joiners.await.unwrap();

    let err = group::await_members(&mut host, "bw", 3, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let err = group::await_members(&mut host, "nope", 1, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_one_way_kill_ends_mainloop() {
    let (target, handle) = common::spawn_peer(Duration::from_secs(30)).await;
    let client = common::new_peer().await;
    assert_ok!(group::kill(&client, &target).await);
    let peer = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("mainloop did not end")
        .unwrap();
    assert!(peer.is_done());
}

#[tokio::test]
async fn test_kill_unreachable_peer() {
    let client = common::new_peer().await;
    let dead = common::dead_address().await;
    let err = group::kill(&client, &dead).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailure);
}
