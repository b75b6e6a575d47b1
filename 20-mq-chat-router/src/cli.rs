use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::pool::PoolSize;
use crate::registry::ClientId;
use crate::router::RouterConfig;
use crate::sim::SimConfig;
use crate::transport::Transport;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the router on the shared message queue.
    Router(RouterArgs),
    /// Send commands typed on stdin and print what the router sends back.
    Client(ClientArgs),
    /// Simulate many clients chatting in one room and report latency.
    Sim(SimArgs),
}

/// Which System V queue to use. Every process deriving the same key talks
/// over the same queue.
#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    /// Existing or creatable file used to derive the queue key.
    #[arg(long, env = "MQ_KEY_PATH", default_value = "progfile")]
    pub key_path: PathBuf,

    /// Project id combined with the key file.
    #[arg(long, env = "MQ_PROJECT_ID", default_value_t = 65)]
    pub project_id: u8,
}

impl QueueArgs {
    #[cfg(unix)]
    pub fn open(&self) -> Result<Arc<dyn Transport>> {
        use anyhow::Context;

        let queue = crate::transport::SysvQueue::open(&self.key_path, self.project_id)
            .with_context(|| {
                format!("failed to open message queue for {}", self.key_path.display())
            })?;
        Ok(Arc::new(queue))
    }

    #[cfg(not(unix))]
    pub fn open(&self) -> Result<Arc<dyn Transport>> {
        anyhow::bail!("System V message queues are only available on unix hosts")
    }
}

#[derive(Args, Debug, Clone)]
pub struct RouterArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Dispatch workers. Non-positive values fall back to the number of
    /// hardware threads.
    #[arg(long, env = "ROUTER_WORKERS", allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Give room deliveries their own pool of this many workers.
    #[arg(long, env = "ROUTER_DELIVERY_WORKERS")]
    pub delivery_workers: Option<usize>,

    /// Consecutive failed receives tolerated before the router stops.
    #[arg(long, default_value_t = 5)]
    pub receive_retries: u32,

    /// Pause after a failed receive, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub retry_backoff_ms: u64,
}

impl RouterArgs {
    pub fn config(&self) -> RouterConfig {
        RouterConfig {
            workers: PoolSize::resolve(self.workers),
            delivery_workers: self.delivery_workers.map(PoolSize::from),
            receive_retries: self.receive_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Client id to use; defaults to this process id.
    #[arg(long)]
    pub id: Option<ClientId>,
}

#[derive(Args, Debug, Clone)]
pub struct SimArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Number of virtual clients.
    #[arg(long, default_value_t = 10)]
    pub clients: usize,

    /// Messages each client sends.
    #[arg(long, default_value_t = 50)]
    pub messages: usize,

    /// Room every client joins and talks in.
    #[arg(long, default_value = "room1")]
    pub room: String,

    /// Pause between two messages of one client, in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub interval_ms: u64,

    /// Id of the first virtual client.
    #[arg(long, default_value_t = 1000)]
    pub base_id: ClientId,

    /// How long to wait for joins and deliveries, in seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Start a router inside this process instead of using the shared queue.
    #[arg(long)]
    pub in_process: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SimArgs {
    pub fn config(&self) -> SimConfig {
        SimConfig {
            clients: self.clients,
            messages_per_client: self.messages,
            room: self.room.clone(),
            interval: Duration::from_millis(self.interval_ms),
            base_id: self.base_id,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
