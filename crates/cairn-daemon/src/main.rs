//! cairn-daemon: a Cairn DHT node process.
//!
//! Single OS process on a current-thread Tokio runtime: one UDP socket,
//! one router. Incoming queries are answered through the router's
//! outgoing path (which decorates them with next hops), incoming replies
//! feed its searches, and a periodic tick drives timeouts, reach decay
//! and the maintenance searches.

mod config;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use cairn_dht::router::{MessageBus, Router};
use cairn_proto::message::{keys, Message, QueryKind};
use cairn_proto::node::{NodeAddress, NodeId};

use crate::config::DaemonConfig;

/// Collects the router's outgoing messages during one handler call;
/// flushed to the socket afterwards.
struct QueueBus {
    queue: Vec<(NodeAddress, Message)>,
}

impl MessageBus for QueueBus {
    fn dispatch(&mut self, destination: NodeAddress, message: Message) {
        self.queue.push((destination, message));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse()?),
        )
        .init();

    info!("Cairn daemon starting");

    // 1. Load config
    let config = DaemonConfig::load()?;
    config.router.validate()?;

    // 2. Generate this run's identity
    let my_id = NodeId::new(rand::random());
    info!(node_id = %my_id, "generated node identity");

    // 3. Bind the socket
    let listen = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.network.listen_port);
    let socket = UdpSocket::bind(listen).await.context("binding UDP socket")?;
    info!(addr = %socket.local_addr()?, "listening");

    // 4. Build the router and seed it
    let mut router = Router::new(my_id, config.router.clone());
    for entry in &config.network.seed_nodes {
        match config::parse_seed(entry) {
            Ok((id, addr)) => {
                router.add_node(id, addr);
                info!(node = %id, addr = %addr, "seeded peer");
            }
            Err(error) => warn!(seed = %entry, error = %error, "ignoring malformed seed"),
        }
    }

    // 5. Serve
    let start = Instant::now();
    let mut bus = QueueBus { queue: Vec::new() };
    let mut buf = vec![0u8; 4096];
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.network.tick_interval_ms.max(50)));

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, SocketAddr::V4(peer))) => {
                        handle_datagram(&buf[..len], peer, &mut router, now_ms(start), &mut bus);
                    }
                    Ok((_, SocketAddr::V6(peer))) => {
                        debug!(peer = %peer, "ignoring IPv6 datagram");
                    }
                    Err(error) => warn!(error = %error, "socket receive failed"),
                }
            }
            _ = ticker.tick() => {
                router.tick(now_ms(start), &mut bus);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
        flush(&socket, &mut bus).await;
    }

    info!(
        peers = router.node_store().len(),
        searches = router.search_count(),
        "Cairn daemon stopped"
    );
    Ok(())
}

/// Milliseconds since daemon start; the router's clock.
fn now_ms(start: Instant) -> u64 {
    start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddrV4,
    router: &mut Router,
    now_ms: u64,
    bus: &mut QueueBus,
) {
    let source = NodeAddress::from(peer);
    let message = match Message::from_bytes(datagram) {
        Ok(message) => message,
        Err(error) => {
            debug!(peer = %peer, error = %error, "dropping undecodable datagram");
            return;
        }
    };
    match message.message_type() {
        Some(tag) if tag == keys::QUERY => answer_query(&message, source, router, bus),
        Some(tag) if tag == keys::REPLY => router.handle_incoming(&message, source, now_ms, bus),
        _ => debug!(peer = %peer, "ignoring message of unknown type"),
    }
}

/// Answer an inbound query. The reply skeleton echoes the transaction
/// id; the router stamps our id and, for targeted queries, the best
/// next hops.
fn answer_query(query: &Message, source: NodeAddress, router: &mut Router, bus: &mut QueueBus) {
    let Some(kind) = query.query_name().and_then(QueryKind::from_wire) else {
        debug!(source = %source, "ignoring unsupported query");
        return;
    };
    let Some(tid) = query.transaction_id() else {
        return;
    };
    debug!(source = %source, kind = ?kind, "answering query");
    let mut reply = Message::new();
    reply.put_string(keys::TRANSACTION_ID, tid);
    reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
    router.handle_outgoing(&mut reply, Some((query, source)));
    bus.dispatch(source, reply);
}

async fn flush(socket: &UdpSocket, bus: &mut QueueBus) {
    for (destination, message) in bus.queue.drain(..) {
        let bytes = message.to_bytes();
        if let Err(error) = socket
            .send_to(&bytes, SocketAddr::V4(destination.to_socket_addr()))
            .await
        {
            warn!(peer = %destination, error = %error, "send failed");
        }
    }
}
