use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{Address, Transport};
use crate::error::TransportError;
use crate::message::Packet;

/// In-process queue with one unbounded FIFO per address.
///
/// Queues are created on first use by either side. Closing drops the
/// shutdown sender, which wakes every blocked receiver at once.
pub struct MemoryTransport {
    queues: Mutex<HashMap<Address, Queue>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

#[derive(Clone)]
struct Queue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = unbounded();
        Self {
            queues: Mutex::new(HashMap::new()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Number of payloads waiting at `at`.
    pub fn pending(&self, at: Address) -> usize {
        self.queue(at).rx.len()
    }

    fn queue(&self, address: Address) -> Queue {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(address)
            .or_insert_with(|| {
                let (tx, rx) = unbounded();
                Queue { tx, rx }
            })
            .clone()
    }

    fn is_closed(&self) -> bool {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: Address, packet: &Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // Re-bound the text so in-memory payloads match what the wire allows.
        let packet = Packet::new(packet.client_id, packet.text.clone(), packet.timestamp_us);
        self.queue(to)
            .tx
            .send(packet)
            .map_err(|_| TransportError::Closed)
    }

    fn receive(&self, at: Address) -> Result<Packet, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let queue = self.queue(at);
        crossbeam_channel::select! {
            recv(queue.rx) -> packet => packet.map_err(|_| TransportError::Closed),
            recv(self.shutdown_rx) -> _ => Err(TransportError::Closed),
        }
    }

    fn receive_timeout(
        &self,
        at: Address,
        timeout: Duration,
    ) -> Result<Option<Packet>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let queue = self.queue(at);
        crossbeam_channel::select! {
            recv(queue.rx) -> packet => packet.map(Some).map_err(|_| TransportError::Closed),
            recv(self.shutdown_rx) -> _ => Err(TransportError::Closed),
            default(timeout) => Ok(None),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
