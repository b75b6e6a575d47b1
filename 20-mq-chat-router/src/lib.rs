//! Process-local chat router on top of a System V message queue.
//!
//! Clients write text commands to the queue's control address; one router
//! process parses them, keeps track of clients and rooms, and writes replies
//! and deliveries back to each client's own address. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for router, client and
//!   simulator modes.
//! - [`transport`] moves fixed-size payloads between addresses, either over a
//!   kernel message queue or in memory for tests and in-process simulation.
//! - [`message`] defines the payload, reply prefixes and delivery lines.
//! - [`command`] parses the text command protocol.
//! - [`registry`] and [`room`] hold the shared client and room state.
//! - [`pool`] is the fixed-size worker pool commands and deliveries run on.
//! - [`router`] ties it together: a receive loop feeding a dispatcher.
//! - [`client`] is the interactive terminal client.
//! - [`sim`] drives many virtual clients and reports delivery latency.
//!
//! Integration tests drive a router over the in-memory transport.

pub mod cli;
pub mod client;
pub mod command;
pub mod error;
pub mod message;
pub mod pool;
pub mod registry;
pub mod room;
pub mod router;
pub mod sim;
pub mod transport;
