//! TCP server that accepts client connections and spawns handler tasks.
//!
//! Also starts the agent runtime on the peer port. On SIGINT the server
//! stops accepting clients, lets the agent leave the ring, then waits for
//! in-flight requests to drain before exiting.

use std::sync::Arc;

use ringkv_cluster::{LocalNode, MemoryCache, MemoryOwners, MemoryStorage, NodeAddr, NodeAgent};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::{agent, connection};

/// Capacity of the queue between client handlers and the agent runtime.
const PUSH_QUEUE_DEPTH: usize = 256;

/// Binds both listeners, joins the ring and runs until SIGINT.
pub async fn run(cfg: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = cfg.coordinator_endpoint()?;
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    let peer_listener = TcpListener::bind((cfg.host.as_str(), cfg.peer_port)).await?;
    let client_port = listener.local_addr()?.port();
    let peer_port = peer_listener.local_addr()?.port();

    let node = Arc::new(LocalNode::new(
        NodeAddr::new(cfg.host.clone(), client_port, peer_port),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryCache::new(cfg.cache_capacity)),
        Arc::new(MemoryOwners::new()),
    ));
    info!(
        node = %node.addr(),
        position = %node.addr().position(),
        "listening for clients on {}:{client_port}, peers on {}:{peer_port} (max {} connections)",
        cfg.host,
        cfg.host,
        cfg.max_connections
    );

    let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut agent_task = tokio::spawn(agent::run(
        NodeAgent::new(node.clone(), coordinator),
        peer_listener,
        push_rx,
        stop_rx,
        cfg.peer_timeout(),
    ));

    let max_conn = cfg.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_conn));
    let idle_timeout = cfg.idle_timeout();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, leaving the ring...");
                break;
            }

            // the agent only finishes early if the join failed
            result = &mut agent_task => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("could not join the ring: {e}").into()),
                    Err(e) => Err(format!("agent task failed: {e}").into()),
                };
            }

            result = listener.accept() => {
                let (stream, peer) = result?;

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, dropping connection from {peer}");
                        drop(stream);
                        continue;
                    }
                };

                let node = node.clone();
                let push_tx = push_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, node, push_tx, idle_timeout).await {
                        error!("connection error from {peer}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }

    let _ = stop_tx.send(());
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("agent stopped with error: {e}"),
        Err(e) => warn!("agent task failed: {e}"),
    }

    // the node is STOPPED now, so remaining clients only get server_stopped
    info!("waiting for active connections to close...");
    let _ = semaphore.acquire_many(max_conn as u32).await;
    info!("all connections drained, shutting down");

    Ok(())
}
