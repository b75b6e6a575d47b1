use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::TransportError,
    message::{Packet, latency_micros},
    registry::ClientId,
    transport::{Address, Transport},
};

/// How long the inbound listener blocks before checking whether the session
/// has ended.
const LISTEN_POLL: Duration = Duration::from_millis(200);

/// Pause between two lines replayed from a file.
const REPLAY_PAUSE: Duration = Duration::from_millis(100);

const REPLAY_USAGE: &str = "usage: file <say|dm> <room-or-client-id> <path>";

pub async fn run(args: ClientArgs) -> Result<()> {
    let transport = args.queue.open()?;
    let id = match args.id {
        Some(id) => id,
        None => ClientId::try_from(std::process::id())
            .context("process id does not fit a client id")?,
    };
    if id <= 0 {
        bail!("client id must be positive, got {id}");
    }
    info!(client = id, "connected to router queue");

    let stdin = BufReader::new(tokio::io::stdin());
    run_session(transport, id, stdin, tokio::io::stdout()).await
}

/// Forwards lines from `input` to the router as client `id` and writes
/// everything addressed to `id` to `output`, until `quit`, end of input,
/// ctrl-c, or the queue going away.
pub async fn run_session<R, W>(
    transport: Arc<dyn Transport>,
    id: ClientId,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let listener = spawn_listener(Arc::clone(&transport), id, inbound_tx);
    let mut lines = input.lines();

    let outcome = loop {
        select! {
            packet = inbound_rx.recv() => match packet {
                Some(packet) => {
                    if let Err(err) = write_line(&mut output, &render_inbound(&packet)).await {
                        break Err(err.into());
                    }
                }
                None => {
                    break write_line(&mut output, "*** message queue closed")
                        .await
                        .map_err(Into::into);
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match handle_input(&transport, id, &line, &mut output).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(err) => break Err(err),
                },
                Ok(None) => break Ok(()),
                Err(err) => break Err(err.into()),
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break Ok(());
            }
        }
    };

    // Dropping the receiver tells the listener to stop at its next poll.
    drop(inbound_rx);
    if let Err(error) = listener.await {
        warn!(?error, "inbound listener failed");
    }
    outcome
}

/// Text printed for one payload addressed to this client.
pub fn render_inbound(packet: &Packet) -> String {
    format!(
        "[Message Received]: {} (latency {} us)",
        packet.text,
        latency_micros(packet.timestamp_us)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerb {
    Say,
    Dm,
}

impl ReplayVerb {
    fn as_str(self) -> &'static str {
        match self {
            ReplayVerb::Say => "say",
            ReplayVerb::Dm => "dm",
        }
    }
}

/// `file <say|dm> <target> <path>`: sends every non-empty line of a file as
/// its own `say` or `dm` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub verb: ReplayVerb,
    pub target: String,
    pub path: PathBuf,
}

impl Replay {
    /// `None` when `line` is not a `file` command at all.
    pub fn parse(line: &str) -> Option<Result<Self, &'static str>> {
        let mut tokens = line.split_whitespace();
        if !tokens.next()?.eq_ignore_ascii_case("file") {
            return None;
        }
        let parts: Vec<&str> = tokens.collect();
        let [verb, target, path] = parts.as_slice() else {
            return Some(Err(REPLAY_USAGE));
        };
        let verb = match verb.to_ascii_lowercase().as_str() {
            "say" => ReplayVerb::Say,
            "dm" => ReplayVerb::Dm,
            _ => return Some(Err(REPLAY_USAGE)),
        };
        Some(Ok(Self {
            verb,
            target: (*target).to_string(),
            path: PathBuf::from(*path),
        }))
    }

    fn command_for(&self, line: &str) -> String {
        format!("{} {} {}", self.verb.as_str(), self.target, line)
    }
}

/// Returns whether the session should keep going.
async fn handle_input<W>(
    transport: &Arc<dyn Transport>,
    id: ClientId,
    line: &str,
    output: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let text = line.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("quit") {
        write_line(output, "*** leaving chat").await?;
        return Ok(false);
    }

    match Replay::parse(text) {
        Some(Ok(replay)) => {
            match replay_file(transport, id, &replay, output).await {
                Ok(sent) => debug!(client = id, sent, path = %replay.path.display(), "replay finished"),
                Err(err) => write_line(output, &format!("!!! {err:#}")).await?,
            }
            Ok(true)
        }
        Some(Err(usage)) => {
            write_line(output, usage).await?;
            Ok(true)
        }
        None => {
            send_command(transport, id, text.to_string()).await?;
            Ok(true)
        }
    }
}

async fn replay_file<W>(
    transport: &Arc<dyn Transport>,
    id: ClientId,
    replay: &Replay,
    output: &mut W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let contents = tokio::fs::read_to_string(&replay.path)
        .await
        .with_context(|| format!("failed to read {}", replay.path.display()))?;

    let mut sent = 0;
    for line in contents.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
        let command = replay.command_for(line);
        send_command(transport, id, command.clone()).await?;
        write_line(output, &format!("[Sent]: {command}")).await?;
        sent += 1;
        tokio::time::sleep(REPLAY_PAUSE).await;
    }
    Ok(sent)
}

async fn send_command(transport: &Arc<dyn Transport>, id: ClientId, text: String) -> Result<()> {
    let transport = Arc::clone(transport);
    tokio::task::spawn_blocking(move || transport.send(Address::Control, &Packet::command(id, text)))
        .await
        .context("send task failed")?
        .context("failed to send command")
}

/// Blocking receive loop on the client's address, feeding `inbound`.
fn spawn_listener(
    transport: Arc<dyn Transport>,
    id: ClientId,
    inbound: mpsc::UnboundedSender<Packet>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !inbound.is_closed() {
            match transport.receive_timeout(Address::Client(id), LISTEN_POLL) {
                Ok(Some(packet)) => {
                    if inbound.send(packet).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(TransportError::Interrupted) => {}
                Err(err) if err.is_fatal() => {
                    debug!(client = id, error = %err, "listener stopping");
                    break;
                }
                Err(err) => {
                    warn!(client = id, error = %err, "receive failed");
                    std::thread::sleep(LISTEN_POLL);
                }
            }
        }
    })
}

async fn write_line<W>(output: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
