//! Chat rooms and their fan-out.
//!
//! A room only knows member ids. Broadcasting turns one `say` into one pool
//! task per member; a failed send is logged and the other members are still
//! served.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::message::{Reply, room_delivery};
use crate::pool::WorkerPool;
use crate::registry::{Client, ClientId};
use crate::transport::{Address, Transport};

/// A named set of members. Members are client ids; the clients themselves
/// live in the [`Registry`](crate::registry::Registry).
#[derive(Debug)]
pub struct Room {
    name: String,
    members: Mutex<BTreeSet<ClientId>>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn members_guard(&self) -> MutexGuard<'_, BTreeSet<ClientId>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `client`. Returns `false` when it was already a member.
    pub fn join(&self, client: &Client) -> bool {
        let added = self.members_guard().insert(client.id());
        if added {
            debug!(room = %self.name, client = client.id(), "joined room");
        } else {
            debug!(room = %self.name, client = client.id(), "already a member");
        }
        added
    }

    /// Removes `client`. Returns `false` when it was not a member.
    pub fn leave(&self, client: &Client) -> bool {
        let removed = self.members_guard().remove(&client.id());
        if removed {
            debug!(room = %self.name, client = client.id(), "left room");
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.members_guard().contains(&id)
    }

    /// Current members in ascending id order.
    pub fn members(&self) -> Vec<ClientId> {
        self.members_guard().iter().copied().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members_guard().len()
    }

    /// Fans `text` out to every current member, the sender included when it
    /// is a member, as one pool task per recipient.
    ///
    /// The member snapshot, the formatting and the enqueueing all happen
    /// under the room lock, so a concurrent join or leave lands entirely
    /// before or after this broadcast. The sends themselves run on the pool
    /// after the lock is released; one failed send never affects the others.
    ///
    /// Returns how many sends were enqueued.
    pub fn broadcast(
        &self,
        sender: ClientId,
        text: &str,
        timestamp_us: i64,
        pool: &WorkerPool,
        transport: &Arc<dyn Transport>,
    ) -> usize {
        let members = self.members_guard();
        let line = room_delivery(sender, &self.name, text);
        debug!(room = %self.name, sender, recipients = members.len(), "broadcasting");

        let mut enqueued = 0;
        for &member in members.iter() {
            let recipient = Address::Client(member);
            let packet = Reply::delivery(recipient, line.clone(), timestamp_us).into_packet(sender);
            let transport = Arc::clone(transport);
            let submitted = pool.submit(move || {
                if let Err(err) = transport.send(recipient, &packet) {
                    warn!(%recipient, error = %err, "room delivery failed");
                }
            });
            match submitted {
                Ok(()) => enqueued += 1,
                Err(err) => {
                    warn!(room = %self.name, %recipient, error = %err, "could not enqueue delivery")
                }
            }
        }
        enqueued
    }
}
