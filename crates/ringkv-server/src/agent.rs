//! Agent runtime: drives the membership agent over real sockets.
//!
//! One task owns the [`NodeAgent`]. It accepts peer connections one at
//! a time, reads a single frame from each and feeds it to the agent,
//! then performs the resulting deliveries in order before accepting the
//! next connection. Replica refreshes queued by client handlers go
//! through the same task so outbound traffic stays sequential.

use std::collections::VecDeque;
use std::time::Duration;

use ringkv_cluster::{transport, ClusterError, NodeAgent, Outbound};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Joins the ring, then serves peer traffic until `shutdown` fires, at
/// which point the node leaves gracefully.
///
/// Fails only if the initial join cannot be delivered.
pub async fn run(
    mut agent: NodeAgent,
    listener: TcpListener,
    mut pushes: mpsc::Receiver<Vec<Outbound>>,
    mut shutdown: oneshot::Receiver<()>,
    timeout: Duration,
) -> Result<(), ClusterError> {
    let (to, join) = agent.join_request();
    transport::send(&to, &join, timeout).await?;
    info!(coordinator = %to, node = %agent.node().addr(), "join requested");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                let out = agent.leave();
                deliver(&mut agent, out, timeout).await;
                info!("left the ring");
                return Ok(());
            }

            Some(batch) = pushes.recv() => {
                deliver(&mut agent, batch, timeout).await;
            }

            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("peer accept failed: {e}");
                        continue;
                    }
                };
                let msg = match transport::read_message(&mut stream, timeout).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%peer, "dropping peer frame: {e}");
                        continue;
                    }
                };
                drop(stream);

                let kind = msg.kind();
                debug!(%peer, kind, "peer message");
                match agent.handle_message(msg) {
                    Ok(out) => deliver(&mut agent, out, timeout).await,
                    Err(e) => warn!(%peer, kind, "rejected peer message: {e}"),
                }
            }
        }
    }
}

/// Sends each delivery in order. Failures are reported back to the
/// agent, and whatever it answers with is sent too.
async fn deliver(agent: &mut NodeAgent, out: Vec<Outbound>, timeout: Duration) {
    let mut queue: VecDeque<Outbound> = out.into();
    while let Some((to, msg)) = queue.pop_front() {
        if let Err(e) = transport::send(&to, &msg, timeout).await {
            debug!(%to, kind = msg.kind(), "delivery failed: {e}");
            queue.extend(agent.on_delivery_failed(&to, &msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ringkv_cluster::{
        Endpoint, LocalNode, MemoryCache, MemoryOwners, MemoryStorage, NodeAddr, PeerMessage,
    };

    fn agent(peer_port: u16, coordinator: Endpoint) -> NodeAgent {
        let node = LocalNode::new(
            NodeAddr::new("127.0.0.1", 5001, peer_port),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCache::new(8)),
            Arc::new(MemoryOwners::new()),
        );
        NodeAgent::new(Arc::new(node), coordinator)
    }

    async fn recv(listener: &TcpListener) -> PeerMessage {
        let (mut stream, _) = listener.accept().await.unwrap();
        transport::read_message(&mut stream, Duration::from_secs(2))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn joins_answers_heartbeat_and_leaves() {
        let coordinator = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let coord_ep = Endpoint::new("127.0.0.1", coordinator.local_addr().unwrap().port());

        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_ep = Endpoint::new("127.0.0.1", peer.local_addr().unwrap().port());

        let (_push_tx, push_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            agent(peer_ep.port, coord_ep),
            peer,
            push_rx,
            stop_rx,
            Duration::from_secs(2),
        ));

        assert!(matches!(recv(&coordinator).await, PeerMessage::Join(_)));

        let heartbeat = PeerMessage::Heartbeat {
            ip: "127.0.0.1".into(),
            client_port: 5001,
        };
        transport::send(&peer_ep, &heartbeat, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            recv(&coordinator).await,
            PeerMessage::StillAlive { client_port: 5001, .. }
        ));

        stop_tx.send(()).unwrap();
        match recv(&coordinator).await {
            PeerMessage::Leave { successor, .. } => assert!(successor.is_none()),
            other => panic!("expected leave, got {other:?}"),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn join_fails_without_coordinator() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_push_tx, push_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = oneshot::channel();

        let result = run(
            agent(6001, Endpoint::new("127.0.0.1", closed)),
            peer,
            push_rx,
            stop_rx,
            Duration::from_secs(1),
        )
        .await;
        assert!(result.unwrap_err().is_network());
    }
}
