//! Receive loop and command dispatcher.
//!
//! One dedicated receiver thread pulls payloads off the control address and
//! hands each one to the dispatch pool as a single task. The task parses the
//! text, runs the command against the [`Registry`] and sends replies back
//! through the transport. The receiver never waits for command processing.
//!
//! Room fan-out and online notifications go to the delivery pool. By default
//! that is the dispatch pool itself; [`RouterConfig::delivery_workers`] gives
//! deliveries their own pool so large broadcasts cannot starve ingestion.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::{CommandError, PoolError, TransportError};
use crate::message::{HELP_TEXT, Packet, Reply, direct_delivery};
use crate::pool::{PoolSize, WorkerPool};
use crate::registry::{Client, ClientId, Registry};
use crate::transport::{Address, Transport};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub workers: PoolSize,
    /// Separate pool for deliveries; `None` shares the dispatch pool.
    pub delivery_workers: Option<PoolSize>,
    /// Consecutive failed receives tolerated before the receiver gives up.
    pub receive_retries: u32,
    /// Base pause after a failed receive; grows linearly with each retry.
    pub retry_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: PoolSize::default_for_host(),
            delivery_workers: None,
            receive_retries: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Executes parsed commands against the registry.
pub struct Dispatcher {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    delivery_pool: Arc<WorkerPool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        delivery_pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            registry,
            transport,
            delivery_pool,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Processes one inbound payload to completion.
    ///
    /// A rejected command produces exactly one `[ERROR]` reply to the sender;
    /// an accepted command that does not deliver anything produces exactly
    /// one `[INFO]` reply. Both carry the payload's timestamp.
    pub fn handle(&self, packet: Packet) {
        let sender = packet.client_id;
        let reply_to = Address::Client(sender);
        let timestamp_us = packet.timestamp_us;

        match self.execute(&packet) {
            Ok(Some(info)) => self.reply(Reply::info(reply_to, info, timestamp_us), sender),
            Ok(None) => {}
            Err(err) => {
                debug!(sender, kind = ?err.kind(), error = %err, "command rejected");
                self.reply(Reply::error(reply_to, err.to_string(), timestamp_us), sender);
            }
        }
    }

    fn execute(&self, packet: &Packet) -> Result<Option<String>, CommandError> {
        let sender = packet.client_id;
        if sender <= 0 {
            return Err(CommandError::InvalidSender(sender));
        }

        match Command::parse(&packet.text)? {
            Command::Help => Ok(Some(HELP_TEXT.to_string())),
            Command::Unknown { verb } => Err(CommandError::UnknownCommand(verb)),
            Command::Join { room } => {
                let client = self.sender(sender)?;
                self.join(&client, &room).map(Some)
            }
            Command::Leave { room } => {
                let client = self.sender(sender)?;
                self.leave(&client, &room).map(Some)
            }
            Command::Say { room, text } => {
                let client = self.sender(sender)?;
                self.say(&client, &room, &text, packet.timestamp_us)?;
                Ok(None)
            }
            Command::Dm { target, text } => {
                let client = self.sender(sender)?;
                self.direct_message(&client, target, &text, packet.timestamp_us)?;
                Ok(None)
            }
            Command::Online => {
                let client = self.sender(sender)?;
                Ok(Some(self.online(&client, packet.timestamp_us)))
            }
        }
    }

    fn sender(&self, id: ClientId) -> Result<Arc<Client>, CommandError> {
        self.registry
            .find_or_create_client(id)
            .ok_or(CommandError::InvalidSender(id))
    }

    fn join(&self, client: &Client, room_name: &str) -> Result<String, CommandError> {
        let room = self
            .registry
            .find_or_create_room(room_name, true)
            .ok_or_else(|| CommandError::RoomCreation(room_name.to_string()))?;
        if room.join(client) {
            info!(client = client.id(), room = room_name, "client joined room");
        }
        Ok(format!("Joined room {room_name} successfully"))
    }

    fn leave(&self, client: &Client, room_name: &str) -> Result<String, CommandError> {
        let room = self
            .registry
            .find_or_create_room(room_name, false)
            .ok_or_else(|| CommandError::RoomNotFound(room_name.to_string()))?;
        if !room.leave(client) {
            return Err(CommandError::NotMember(room_name.to_string()));
        }
        info!(client = client.id(), room = room_name, "client left room");
        Ok(format!("Left room {room_name} successfully"))
    }

    fn say(
        &self,
        client: &Client,
        room_name: &str,
        text: &str,
        timestamp_us: i64,
    ) -> Result<(), CommandError> {
        let room = self
            .registry
            .find_or_create_room(room_name, false)
            .ok_or_else(|| CommandError::RoomNotFound(room_name.to_string()))?;
        room.broadcast(
            client.id(),
            text,
            timestamp_us,
            &self.delivery_pool,
            &self.transport,
        );
        Ok(())
    }

    fn direct_message(
        &self,
        client: &Client,
        target: ClientId,
        text: &str,
        timestamp_us: i64,
    ) -> Result<(), CommandError> {
        let target = self
            .registry
            .find_or_create_client(target)
            .ok_or(CommandError::TargetNotFound(target))?;
        let line = direct_delivery(client.id(), target.id(), text);
        self.reply(
            Reply::delivery(target.address(), line, timestamp_us),
            client.id(),
        );
        Ok(())
    }

    /// Lists every known client for the requester and tells everyone else
    /// the requester is online.
    fn online(&self, client: &Client, timestamp_us: i64) -> String {
        let ids = self.registry.list_client_ids();
        let notice = format!("Client {} is online", client.id());

        for &other in ids.iter().filter(|&&id| id != client.id()) {
            let packet = Reply::info(Address::Client(other), notice.clone(), timestamp_us)
                .into_packet(client.id());
            let transport = Arc::clone(&self.transport);
            let submitted = self.delivery_pool.submit(move || {
                if let Err(err) = transport.send(Address::Client(other), &packet) {
                    warn!(recipient = other, error = %err, "online notice failed");
                }
            });
            if let Err(err) = submitted {
                warn!(recipient = other, error = %err, "could not enqueue online notice");
            }
        }

        let listed: Vec<String> = ids.iter().map(ToString::to_string).collect();
        format!("Online clients: {}", listed.join(", "))
    }

    fn reply(&self, reply: Reply, origin: ClientId) {
        let recipient = reply.recipient;
        if let Err(err) = self.transport.send(recipient, &reply.into_packet(origin)) {
            warn!(%recipient, error = %err, "failed to send reply");
        }
    }
}

pub struct Router {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    dispatch_pool: Arc<WorkerPool>,
    delivery_pool: Arc<WorkerPool>,
    config: RouterConfig,
}

impl Router {
    /// Builds the registry and pools. Nothing is received until
    /// [`Router::run`] or [`Router::spawn`].
    pub fn new(transport: Arc<dyn Transport>, config: RouterConfig) -> Result<Self, PoolError> {
        let dispatch_pool = Arc::new(WorkerPool::new("dispatch", config.workers)?);
        let delivery_pool = match config.delivery_workers {
            Some(size) => Arc::new(WorkerPool::new("delivery", size)?),
            None => Arc::clone(&dispatch_pool),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Registry::new()),
            Arc::clone(&transport),
            Arc::clone(&delivery_pool),
        ));

        Ok(Self {
            transport,
            dispatcher,
            dispatch_pool,
            delivery_pool,
            config,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.dispatcher.registry())
    }

    /// Receives from the control address until the transport is closed.
    ///
    /// Transient receive failures are retried with a linearly growing pause;
    /// more than `receive_retries` in a row, or a fatal error, ends the loop
    /// with that error. A closed transport ends it cleanly.
    pub fn run(&self) -> Result<(), TransportError> {
        info!(
            workers = self.dispatch_pool_size(),
            separate_delivery = self.config.delivery_workers.is_some(),
            "router started, waiting for messages"
        );

        let mut failures: u32 = 0;
        loop {
            match self.transport.receive(Address::Control) {
                Ok(packet) => {
                    failures = 0;
                    self.dispatch(packet);
                }
                Err(TransportError::Closed) => {
                    info!("control queue closed, receiver stopping");
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "fatal receive error");
                    return Err(err);
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.config.receive_retries {
                        error!(attempts = failures, error = %err, "receive keeps failing, giving up");
                        return Err(err);
                    }
                    warn!(attempt = failures, error = %err, "receive failed, retrying");
                    thread::sleep(backoff(self.config.retry_backoff, failures));
                }
            }
        }
    }

    fn dispatch(&self, packet: Packet) {
        debug!(sender = packet.client_id, text = %packet.text, "received");
        let dispatcher = Arc::clone(&self.dispatcher);
        if let Err(err) = self.dispatch_pool.submit(move || dispatcher.handle(packet)) {
            warn!(error = %err, "dropping message, dispatch pool unavailable");
        }
    }

    fn dispatch_pool_size(&self) -> usize {
        self.config.workers.get()
    }

    /// Runs the receive loop on a `router-receiver` thread.
    pub fn spawn(self) -> Result<RouterHandle> {
        let router = Arc::new(self);
        let receiver = {
            let router = Arc::clone(&router);
            thread::Builder::new()
                .name("router-receiver".to_string())
                .spawn(move || router.run())
                .context("failed to spawn router receiver")?
        };

        Ok(RouterHandle {
            router,
            receiver: Some(receiver),
        })
    }

    /// Drains the dispatch pool, then the delivery pool when it is separate.
    fn drain(&self) -> Result<(), PoolError> {
        self.dispatch_pool.shutdown()?;
        if !Arc::ptr_eq(&self.dispatch_pool, &self.delivery_pool) {
            self.delivery_pool.shutdown()?;
        }
        Ok(())
    }
}

/// Pause before retry number `attempt`, saturating instead of overflowing.
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt).unwrap_or(Duration::MAX)
}

pub struct RouterHandle {
    router: Arc<Router>,
    receiver: Option<JoinHandle<Result<(), TransportError>>>,
}

impl RouterHandle {
    pub fn registry(&self) -> Arc<Registry> {
        self.router.registry()
    }

    pub fn is_finished(&self) -> bool {
        self.receiver
            .as_ref()
            .is_none_or(|receiver| receiver.is_finished())
    }

    /// Closes the transport, then waits like [`RouterHandle::wait`].
    ///
    /// Tasks still queued at this point run to completion, but their replies
    /// and deliveries fail with [`TransportError::Closed`] and are dropped.
    pub fn shutdown(self) -> Result<()> {
        self.router
            .transport
            .close()
            .context("failed to close transport")?;
        self.wait()
    }

    /// Blocks until the receiver stops, then drains the pools.
    ///
    /// Returns the receiver's error when it stopped on a persistent failure.
    pub fn wait(mut self) -> Result<()> {
        let outcome = match self.receiver.take() {
            Some(receiver) => receiver
                .join()
                .map_err(|_| anyhow!("router receiver panicked"))?,
            None => Ok(()),
        };
        self.router.drain().context("failed to drain worker pools")?;
        info!("router stopped");
        outcome.context("router receiver failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn dispatcher() -> (Dispatcher, Arc<MemoryTransport>, Arc<WorkerPool>) {
        let memory = Arc::new(MemoryTransport::new());
        let pool = Arc::new(WorkerPool::new("dispatcher-test", 2).unwrap());
        let transport: Arc<dyn Transport> = memory.clone();
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()), transport, Arc::clone(&pool));
        (dispatcher, memory, pool)
    }

    fn next_text(memory: &MemoryTransport, id: ClientId) -> String {
        memory
            .receive_timeout(Address::Client(id), Duration::from_secs(1))
            .unwrap()
            .expect("expected a payload")
            .text
    }

    #[test]
    fn join_replies_with_info_and_registers_member() {
        let (dispatcher, memory, _pool) = dispatcher();
        dispatcher.handle(Packet::new(1001, "join lobby", 5));

        assert_eq!(next_text(&memory, 1001), "[INFO] Joined room lobby successfully");
        let room = dispatcher.registry().find_or_create_room("lobby", false).unwrap();
        assert_eq!(room.members(), vec![1001]);
    }

    #[test]
    fn invalid_sender_short_circuits() {
        let (dispatcher, memory, _pool) = dispatcher();
        dispatcher.handle(Packet::new(0, "join lobby", 5));

        assert_eq!(next_text(&memory, 0), "[ERROR] Invalid client ID: 0");
        assert!(dispatcher.registry().room_names().is_empty());
        assert!(dispatcher.registry().list_client_ids().is_empty());
    }

    #[test]
    fn help_and_unknown_do_not_register_clients() {
        let (dispatcher, memory, _pool) = dispatcher();
        dispatcher.handle(Packet::new(7, "help", 1));
        dispatcher.handle(Packet::new(7, "foo bar", 2));

        assert_eq!(next_text(&memory, 7), format!("[INFO] {HELP_TEXT}"));
        assert_eq!(next_text(&memory, 7), "[ERROR] Unknown command: foo");
        assert!(dispatcher.registry().list_client_ids().is_empty());
    }

    #[test]
    fn leave_of_missing_room_is_not_found() {
        let (dispatcher, memory, _pool) = dispatcher();
        dispatcher.handle(Packet::new(7, "leave nowhere", 1));
        assert_eq!(next_text(&memory, 7), "[ERROR] Room not found: nowhere");
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 3), Duration::from_millis(300));
        assert_eq!(backoff(Duration::MAX, 2), Duration::MAX);
        assert_eq!(backoff(Duration::from_secs(u64::MAX / 2), 3), Duration::MAX);
    }

    #[test]
    fn replies_carry_the_command_timestamp() {
        let (dispatcher, memory, _pool) = dispatcher();
        dispatcher.handle(Packet::new(7, "join lobby", 123_456));
        let reply = memory
            .receive_timeout(Address::Client(7), Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(reply.timestamp_us, 123_456);
        assert_eq!(reply.client_id, 7);
    }
}
