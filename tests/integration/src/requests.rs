//! Client protocol against a single-node ring.

use ringkv_protocol::{Reply, KEY_NOT_FOUND, NOT_OWNER, TOO_LONG};

use crate::helpers::{wait_for_members, TestCoordinator, TestNode};

async fn single_node() -> (TestCoordinator, TestNode) {
    let coordinator = TestCoordinator::start();
    let node = TestNode::start(&coordinator);
    wait_for_members(&[&node]).await;
    (coordinator, node)
}

#[tokio::test]
async fn put_get_update_delete() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;

    assert_eq!(c.cmd("put alice color red").await, "put_success color");
    assert_eq!(c.cmd("get color").await, "get_success color red");
    assert_eq!(c.cmd("put alice color dark blue").await, "put_update color");
    assert_eq!(c.cmd("get color").await, "get_success color dark blue");
    assert_eq!(c.cmd("delete alice color").await, "delete_success color");
    assert_eq!(
        c.cmd("get color").await,
        format!("get_error color {KEY_NOT_FOUND}")
    );
}

#[tokio::test]
async fn value_whitespace_is_stored_as_sent() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;

    assert_eq!(c.cmd("put alice spaced a  b\tc").await, "put_success spaced");
    assert_eq!(c.cmd("get spaced").await, "get_success spaced a  b\tc");
}

#[tokio::test]
async fn only_the_owner_may_write() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;

    assert_eq!(c.cmd("put alice pet cat").await, "put_success pet");
    assert_eq!(
        c.cmd("put bob pet dog").await,
        format!("put_error pet {NOT_OWNER}")
    );
    assert_eq!(
        c.cmd("delete bob pet").await,
        format!("delete_error pet {NOT_OWNER}")
    );
    // reads are open to everyone
    assert_eq!(c.cmd("get pet").await, "get_success pet cat");
}

#[tokio::test]
async fn deleting_a_missing_key() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;
    assert_eq!(
        c.cmd("delete alice ghost").await,
        format!("delete_error ghost {KEY_NOT_FOUND}")
    );
}

#[tokio::test]
async fn oversized_key_is_rejected() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;
    let key = "k".repeat(21);
    assert_eq!(
        c.cmd(&format!("put alice {key} v")).await,
        format!("put_error {key} {TOO_LONG}")
    );
}

#[tokio::test]
async fn malformed_requests_get_error_lines() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;
    assert_eq!(c.cmd("frobnicate").await, "error unknown command!");
    assert!(matches!(c.reply("get").await, Reply::Error(_)));
    // the connection stays usable
    assert!(matches!(c.reply("keyrange").await, Reply::KeyrangeSuccess(_)));
}

#[tokio::test]
async fn keyrange_lists_the_single_member() {
    let (_coordinator, node) = single_node().await;
    let mut c = node.connect().await;

    let ranges = c.keyrange().await.unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].endpoint.port, node.port);
    // a lone node covers the whole ring
    assert_eq!(ranges[0].start, ranges[0].end);

    // below three members the read table is the write table
    match c.reply("keyrange_read").await {
        Reply::KeyrangeReadSuccess(text) => assert!(text.contains(&node.name())),
        other => panic!("expected keyrange_read_success, got {other}"),
    }
}
