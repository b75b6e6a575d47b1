//! Addressable message queue the router sits on.
//!
//! Two implementations exist:
//!
//! - [`MemoryTransport`]: in-process FIFOs, one per address, used by tests
//!   and by the in-process simulator.
//! - [`SysvQueue`]: a System V message queue shared by every process that
//!   derives the same key, which is how the router and its clients talk in
//!   production.

use std::fmt;
use std::time::Duration;

use crate::error::TransportError;
use crate::message::Packet;
use crate::registry::ClientId;

mod memory;
#[cfg(unix)]
mod sysv;

pub use memory::MemoryTransport;
#[cfg(unix)]
pub use sysv::SysvQueue;

/// Where a payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// The well-known address every client sends commands to.
    Control,
    Client(ClientId),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Control => f.write_str("control"),
            Address::Client(id) => write!(f, "client {id}"),
        }
    }
}

/// Blocking, FIFO-per-address, best-effort channel.
///
/// Failures are always reported to the caller; nothing is dropped silently
/// at this boundary.
pub trait Transport: Send + Sync {
    fn send(&self, to: Address, packet: &Packet) -> Result<(), TransportError>;

    /// Blocks until a payload addressed to `at` arrives.
    fn receive(&self, at: Address) -> Result<Packet, TransportError>;

    /// Like [`Transport::receive`] but gives up after `timeout`.
    fn receive_timeout(
        &self,
        at: Address,
        timeout: Duration,
    ) -> Result<Option<Packet>, TransportError>;

    /// Destroys the queue. Pending and future receives fail with
    /// [`TransportError::Closed`].
    fn close(&self) -> Result<(), TransportError>;
}
