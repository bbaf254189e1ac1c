//! Joins, departures, failure detection and replication across real
//! processes.

use ringkv_cluster::parse_client_snapshot;
use ringkv_protocol::Reply;

use crate::helpers::{
    owner_of, wait_for_members, wait_for_reply, CoordinatorOptions, TestCoordinator, TestNode,
};

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key{i}")).collect()
}

fn is_get_success(reply: &Reply) -> bool {
    matches!(reply, Reply::GetSuccess { .. })
}

#[tokio::test]
async fn join_hands_off_the_new_nodes_range() {
    let coordinator = TestCoordinator::start();
    let first = TestNode::start(&coordinator);
    wait_for_members(&[&first]).await;

    let mut c = first.connect().await;
    for key in keys(20) {
        assert_eq!(
            c.cmd(&format!("put alice {key} v-{key}")).await,
            format!("put_success {key}")
        );
    }
    drop(c);

    let second = TestNode::start(&coordinator);
    let nodes = [&first, &second];
    let ring = wait_for_members(&nodes).await;

    let mut moved = 0;
    for key in keys(20) {
        let owner = owner_of(&ring, &nodes, &key);
        let other = if owner.port == first.port { &second } else { &first };
        if owner.port == second.port {
            moved += 1;
        }

        let reply = wait_for_reply(owner.port, &format!("get {key}"), "handoff", is_get_success).await;
        assert_eq!(
            reply,
            Reply::GetSuccess {
                key: key.clone(),
                value: format!("v-{key}")
            }
        );

        let mut c = other.connect().await;
        assert_eq!(c.reply(&format!("get {key}")).await, Reply::NotResponsible);
    }
    assert!(moved > 0, "no key hashed into the new node's range");
}

#[tokio::test]
async fn ownership_moves_with_the_data() {
    let coordinator = TestCoordinator::start();
    let first = TestNode::start(&coordinator);
    wait_for_members(&[&first]).await;

    let mut c = first.connect().await;
    for key in keys(20) {
        c.cmd(&format!("put alice {key} v")).await;
    }
    drop(c);

    let second = TestNode::start(&coordinator);
    let nodes = [&first, &second];
    let ring = wait_for_members(&nodes).await;

    let key = keys(20)
        .into_iter()
        .find(|k| owner_of(&ring, &nodes, k).port == second.port)
        .expect("no key moved to the new node");
    wait_for_reply(second.port, &format!("get {key}"), "handoff", is_get_success).await;

    let mut c = second.connect().await;
    assert!(matches!(
        c.reply(&format!("delete bob {key}")).await,
        Reply::DeleteError { .. }
    ));
    assert_eq!(
        c.reply(&format!("delete alice {key}")).await,
        Reply::DeleteSuccess(key)
    );
}

#[cfg(unix)]
#[tokio::test]
async fn graceful_leave_hands_data_to_successor() {
    let coordinator = TestCoordinator::start();
    let first = TestNode::start(&coordinator);
    let second = TestNode::start(&coordinator);
    let nodes = [&first, &second];
    let ring = wait_for_members(&nodes).await;

    for key in keys(20) {
        let owner = owner_of(&ring, &nodes, &key);
        wait_for_reply(
            owner.port,
            &format!("put alice {key} v-{key}"),
            "write lock to clear",
            |r| matches!(r, Reply::PutSuccess(_)),
        )
        .await;
    }

    second.interrupt();
    wait_for_members(&[&first]).await;

    let mut c = first.connect().await;
    for key in keys(20) {
        assert_eq!(
            c.reply(&format!("get {key}")).await,
            Reply::GetSuccess {
                key: key.clone(),
                value: format!("v-{key}")
            },
            "{key} was lost"
        );
    }
}

#[tokio::test]
async fn crashed_node_is_evicted_by_gossip() {
    let coordinator = TestCoordinator::start_with(CoordinatorOptions {
        gossip_interval_ms: 200,
        ..CoordinatorOptions::default()
    });
    let first = TestNode::start(&coordinator);
    let second = TestNode::start(&coordinator);
    wait_for_members(&[&first, &second]).await;

    second.crash();
    let ring = wait_for_members(&[&first]).await;
    assert_eq!(ring[0].endpoint.port, first.port);
}

#[tokio::test]
async fn three_nodes_serve_reads_from_replicas() {
    let coordinator = TestCoordinator::start();
    let a = TestNode::start(&coordinator);
    let b = TestNode::start(&coordinator);
    let c = TestNode::start(&coordinator);
    let nodes = [&a, &b, &c];
    let ring = wait_for_members(&nodes).await;

    let owner = owner_of(&ring, &nodes, "shared");
    wait_for_reply(
        owner.port,
        "put alice shared everywhere",
        "write lock to clear",
        |r| matches!(r, Reply::PutSuccess(_) | Reply::PutUpdate(_)),
    )
    .await;

    let read_ring = match wait_for_reply(owner.port, "keyrange_read", "replica table", |r| {
        matches!(r, Reply::KeyrangeReadSuccess(text) if text.matches(';').count() == 9)
    })
    .await
    {
        Reply::KeyrangeReadSuccess(text) => parse_client_snapshot(&text).unwrap(),
        other => panic!("expected keyrange_read_success, got {other}"),
    };

    let holders: Vec<u16> = read_ring
        .iter()
        .filter(|r| r.covers_key("shared"))
        .map(|r| r.endpoint.port)
        .collect();
    assert_eq!(holders.len(), 3);

    for port in holders {
        let reply = wait_for_reply(port, "get shared", "replica to catch up", |r| {
            matches!(r, Reply::GetSuccess { value, .. } if value == "everywhere")
        })
        .await;
        assert!(is_get_success(&reply));
    }
}
