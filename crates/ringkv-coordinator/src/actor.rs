//! Coordinator runtime.
//!
//! A single actor task owns the [`Coordinator`]. The listener task reads
//! one frame per accepted connection and forwards it over a channel;
//! per-member heartbeat tasks report their send times over the same
//! channel. The actor handles one event or gossip tick at a time and
//! performs the resulting deliveries in order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ringkv_cluster::{transport, ClusterError, Coordinator, NodeAddr, Outbound, PeerMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Something the actor must react to.
#[derive(Debug)]
enum Event {
    Inbound { peer: SocketAddr, msg: PeerMessage },
    HeartbeatSent { ip: String, client_port: u16, at: Instant },
}

struct Actor {
    coordinator: Coordinator,
    heartbeats: HashMap<NodeAddr, JoinHandle<()>>,
    events: mpsc::Sender<Event>,
    heartbeat_interval: Duration,
    timeout: Duration,
}

impl Actor {
    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Inbound { peer, msg } => {
                let kind = msg.kind();
                debug!(%peer, kind, "peer message");
                match self.coordinator.handle_message(msg) {
                    Ok(out) => self.deliver(out).await,
                    Err(e) => log_rejected(kind, &e),
                }
            }
            Event::HeartbeatSent {
                ip,
                client_port,
                at,
            } => self.coordinator.heartbeat_sent(&ip, client_port, at),
        }
        self.sync_heartbeats();
    }

    async fn on_gossip_tick(&mut self) {
        if let Some(start) = self.coordinator.gossip_tick() {
            debug!(to = %start.0, "starting gossip round");
            self.deliver(vec![start]).await;
            self.sync_heartbeats();
        }
    }

    async fn deliver(&mut self, out: Vec<Outbound>) {
        let mut queue: VecDeque<Outbound> = out.into();
        while let Some((to, msg)) = queue.pop_front() {
            if let Err(e) = transport::send(&to, &msg, self.timeout).await {
                debug!(%to, kind = msg.kind(), "delivery failed: {e}");
                queue.extend(self.coordinator.on_delivery_failed(&to, &msg));
            }
        }
    }

    /// Starts a heartbeat task for every new member and aborts the tasks
    /// of members that left.
    fn sync_heartbeats(&mut self) {
        let members = self.coordinator.members();
        self.heartbeats.retain(|addr, task| {
            let keep = members.contains(addr);
            if !keep {
                debug!(node = %addr, "stopping heartbeat");
                task.abort();
            }
            keep
        });
        for addr in members {
            if !self.heartbeats.contains_key(&addr) {
                let task = spawn_heartbeat(
                    addr.clone(),
                    self.heartbeat_interval,
                    self.timeout,
                    self.events.clone(),
                );
                self.heartbeats.insert(addr, task);
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, task) in self.heartbeats.drain() {
            task.abort();
        }
    }
}

fn log_rejected(kind: &str, e: &ClusterError) {
    if e.is_membership() {
        info!(kind, "ignoring event that does not match the ring: {e}");
    } else {
        warn!(kind, "rejected peer message: {e}");
    }
}

/// Sends `heartbeat` to one member every `interval`. The send time is
/// reported before the message goes out so a fast `still_alive` never
/// races ahead of it. Failures are logged only.
fn spawn_heartbeat(
    addr: NodeAddr,
    interval: Duration,
    timeout: Duration,
    events: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let to = addr.peer();
        let msg = PeerMessage::Heartbeat {
            ip: addr.ip.clone(),
            client_port: addr.client_port,
        };

        loop {
            ticker.tick().await;
            let sent = Event::HeartbeatSent {
                ip: addr.ip.clone(),
                client_port: addr.client_port,
                at: Instant::now(),
            };
            if events.send(sent).await.is_err() {
                return;
            }
            if let Err(e) = transport::send(&to, &msg, timeout).await {
                warn!(node = %addr, "heartbeat failed: {e}");
            }
        }
    })
}

/// Reads one frame per accepted connection and forwards it to the actor.
async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>, timeout: Duration) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        match transport::read_message(&mut stream, timeout).await {
            Ok(msg) => {
                if events.send(Event::Inbound { peer, msg }).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(%peer, "dropping peer frame: {e}"),
        }
    }
}

/// Runs the coordinator on `listener` until `shutdown` completes.
pub async fn run(
    listener: TcpListener,
    cfg: &CoordinatorConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let acceptor = tokio::spawn(accept_loop(listener, tx.clone(), cfg.peer_timeout()));

    let mut actor = Actor {
        coordinator: Coordinator::new(),
        heartbeats: HashMap::new(),
        events: tx,
        heartbeat_interval: cfg.heartbeat_interval(),
        timeout: cfg.peer_timeout(),
    };

    let mut gossip = tokio::time::interval(cfg.gossip_interval());
    gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(members = actor.coordinator.ring().len(), "shutting down");
                break;
            }

            Some(event) = rx.recv() => actor.on_event(event).await,

            _ = gossip.tick() => actor.on_gossip_tick().await,
        }
    }

    acceptor.abort();
    actor.shutdown();
    Ok(())
}
