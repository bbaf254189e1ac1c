//! Integration tests for the ringkv-cli binary.

use crate::helpers::{owner_of, run_cli, wait_for_members, TestCoordinator, TestNode};

#[tokio::test]
async fn cli_oneshot_put_get() {
    let coordinator = TestCoordinator::start();
    let node = TestNode::start(&coordinator);
    wait_for_members(&[&node]).await;

    let put = run_cli(node.port, &["put", "alice", "greeting", "hello", "there"]);
    assert!(put.status.success(), "exit code: {:?}", put.status);
    let stdout = String::from_utf8_lossy(&put.stdout);
    assert!(stdout.contains("stored greeting"), "got: {stdout}");

    let get = run_cli(node.port, &["get", "greeting"]);
    assert!(get.status.success());
    let stdout = String::from_utf8_lossy(&get.stdout);
    assert!(stdout.contains("\"hello there\""), "got: {stdout}");
}

#[tokio::test]
async fn cli_routes_to_the_owner() {
    let coordinator = TestCoordinator::start();
    let first = TestNode::start(&coordinator);
    let second = TestNode::start(&coordinator);
    let nodes = [&first, &second];
    let ring = wait_for_members(&nodes).await;

    // a key the seed node is not responsible for
    let key = (0..100)
        .map(|i| format!("route{i}"))
        .find(|k| owner_of(&ring, &nodes, k).port == second.port)
        .expect("no key hashed to the second node");

    let put = run_cli(first.port, &["put", "alice", &key, "v"]);
    assert!(
        put.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&put.stderr)
    );

    let mut c = second.connect().await;
    assert_eq!(c.cmd(&format!("get {key}")).await, format!("get_success {key} v"));
}

#[tokio::test]
async fn cli_missing_key_fails() {
    let coordinator = TestCoordinator::start();
    let node = TestNode::start(&coordinator);
    wait_for_members(&[&node]).await;

    let output = run_cli(node.port, &["get", "nothing"]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("key is not found!"), "got: {stdout}");
}

#[tokio::test]
async fn cli_rejects_unknown_command_locally() {
    let output = run_cli(1, &["frobnicate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid command"), "got: {stderr}");
}
