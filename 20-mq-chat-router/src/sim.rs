//! Load simulator: many virtual clients chatting in one room.
//!
//! Every virtual client joins the room first (waiting for the router's
//! acknowledgement), then all of them start sending at the same moment.
//! Each client counts the room deliveries it receives and measures their
//! latency from the timestamp carried in the payload.

use std::fmt;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::message::{Packet, ReplyKind, latency_micros};
use crate::registry::ClientId;
use crate::router::{Router, RouterConfig};
use crate::transport::{Address, MemoryTransport, Transport};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub clients: usize,
    pub messages_per_client: usize,
    pub room: String,
    /// Pause between two messages of the same client.
    pub interval: Duration,
    /// Id of the first virtual client; the others follow consecutively.
    pub base_id: ClientId,
    /// Upper bound for the join phase and for waiting on deliveries.
    pub timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 10,
            messages_per_client: 50,
            room: "room1".to_string(),
            interval: Duration::from_millis(10),
            base_id: 1000,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimReport {
    pub clients: usize,
    pub messages_per_client: usize,
    pub sent: usize,
    /// Deliveries expected across all clients: every message reaches every
    /// member, the sender included.
    pub expected: usize,
    pub received: usize,
    /// `[ERROR]` replies seen while sending.
    pub errors: usize,
    pub min_latency_us: Option<i64>,
    pub avg_latency_us: Option<i64>,
    pub max_latency_us: Option<i64>,
}

impl SimReport {
    pub fn is_complete(&self) -> bool {
        self.received == self.expected && self.errors == 0
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "clients: {}, messages per client: {}",
            self.clients, self.messages_per_client
        )?;
        writeln!(
            f,
            "sent: {}, received: {}/{}, errors: {}",
            self.sent, self.received, self.expected, self.errors
        )?;
        match (self.min_latency_us, self.avg_latency_us, self.max_latency_us) {
            (Some(min), Some(avg), Some(max)) => {
                write!(f, "latency us: min {min}, avg {avg}, max {max}")
            }
            _ => write!(f, "latency us: no deliveries"),
        }
    }
}

#[derive(Default)]
struct ClientStats {
    sent: usize,
    errors: usize,
    latencies: Vec<i64>,
}

/// Runs the simulation against a router reachable through `transport`.
pub fn run(transport: Arc<dyn Transport>, config: &SimConfig) -> Result<SimReport> {
    if config.clients == 0 {
        bail!("simulation needs at least one client");
    }
    let ids: Vec<ClientId> = (0..config.clients)
        .map(|offset| {
            ClientId::try_from(offset)
                .ok()
                .and_then(|offset| config.base_id.checked_add(offset))
                .filter(|id| *id > 0)
                .context("client ids must stay positive")
        })
        .collect::<Result<_>>()?;

    for &id in &ids {
        join_room(transport.as_ref(), id, config)?;
    }
    info!(clients = ids.len(), room = %config.room, "all clients joined");

    let expected_each = config.clients * config.messages_per_client;
    let deadline = Instant::now() + config.timeout;
    let start = Barrier::new(ids.len());

    let stats: Vec<ClientStats> = thread::scope(|scope| {
        let workers: Vec<_> = ids
            .iter()
            .map(|&id| {
                let transport = Arc::clone(&transport);
                let start = &start;
                scope.spawn(move || {
                    run_client(transport.as_ref(), id, config, expected_each, deadline, start)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_default())
            .collect()
    });

    Ok(summarize(config, &stats))
}

/// Starts a router on a [`MemoryTransport`], runs the simulation against it
/// and shuts the router down again.
pub fn run_in_process(config: &SimConfig, router: RouterConfig) -> Result<SimReport> {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let handle = Router::new(Arc::clone(&transport), router)?.spawn()?;
    let report = run(transport, config);
    handle.shutdown()?;
    report
}

fn join_room(transport: &dyn Transport, id: ClientId, config: &SimConfig) -> Result<()> {
    transport
        .send(Address::Control, &Packet::command(id, format!("join {}", config.room)))
        .with_context(|| format!("client {id} failed to send join"))?;

    let deadline = Instant::now() + config.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("client {id} timed out waiting to join {}", config.room);
        }
        let Some(reply) = transport.receive_timeout(Address::Client(id), remaining)? else {
            continue;
        };
        match ReplyKind::classify(&reply.text) {
            Some(ReplyKind::Info) => return Ok(()),
            Some(ReplyKind::Error) => bail!("client {id} could not join: {}", reply.text),
            _ => debug!(client = id, text = %reply.text, "ignoring payload while joining"),
        }
    }
}

fn run_client(
    transport: &dyn Transport,
    id: ClientId,
    config: &SimConfig,
    expected: usize,
    deadline: Instant,
    start: &Barrier,
) -> ClientStats {
    start.wait();

    thread::scope(|scope| {
        let receiver = scope.spawn(|| collect_deliveries(transport, id, expected, deadline));

        let mut sent = 0;
        for n in 1..=config.messages_per_client {
            let text = format!("say {} Hello from client {id} msg {n}", config.room);
            match transport.send(Address::Control, &Packet::command(id, text)) {
                Ok(()) => sent += 1,
                Err(err) => warn!(client = id, error = %err, "send failed"),
            }
            thread::sleep(config.interval);
        }

        let mut stats = receiver.join().unwrap_or_default();
        stats.sent = sent;
        stats
    })
}

fn collect_deliveries(
    transport: &dyn Transport,
    id: ClientId,
    expected: usize,
    deadline: Instant,
) -> ClientStats {
    let mut stats = ClientStats::default();
    while stats.latencies.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                client = id,
                received = stats.latencies.len(),
                expected,
                "gave up waiting for deliveries"
            );
            break;
        }
        match transport.receive_timeout(Address::Client(id), remaining) {
            Ok(Some(packet)) => match ReplyKind::classify(&packet.text) {
                Some(ReplyKind::Delivery) => {
                    stats.latencies.push(latency_micros(packet.timestamp_us))
                }
                Some(ReplyKind::Error) => {
                    warn!(client = id, text = %packet.text, "router rejected a message");
                    stats.errors += 1;
                }
                _ => {}
            },
            Ok(None) => {}
            Err(err) => {
                warn!(client = id, error = %err, "receive failed");
                break;
            }
        }
    }
    stats
}

fn summarize(config: &SimConfig, stats: &[ClientStats]) -> SimReport {
    let latencies: Vec<i64> = stats
        .iter()
        .flat_map(|client| client.latencies.iter().copied())
        .collect();
    let received = latencies.len();
    let avg = i64::try_from(received)
        .ok()
        .filter(|count| *count > 0)
        .map(|count| latencies.iter().sum::<i64>() / count);

    SimReport {
        clients: config.clients,
        messages_per_client: config.messages_per_client,
        sent: stats.iter().map(|client| client.sent).sum(),
        expected: config.clients * config.clients * config.messages_per_client,
        received,
        errors: stats.iter().map(|client| client.errors).sum(),
        min_latency_us: latencies.iter().copied().min(),
        avg_latency_us: avg,
        max_latency_us: latencies.iter().copied().max(),
    }
}
