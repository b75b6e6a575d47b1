#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use mq_chat_router::{
    error::TransportError,
    message::Packet,
    transport::{Address, SysvQueue, Transport},
};

#[test]
fn payloads_are_routed_by_address() -> Result<()> {
    let queue = SysvQueue::private()?;

    queue.send(Address::Client(7), &Packet::new(1, "for seven", 11))?;
    queue.send(Address::Control, &Packet::new(7, "join lobby", 22))?;

    let control = queue.receive(Address::Control)?;
    assert_eq!(control, Packet::new(7, "join lobby", 22));

    let reply = queue
        .receive_timeout(Address::Client(7), Duration::from_secs(1))?
        .expect("client 7 should have a payload");
    assert_eq!(reply.text, "for seven");
    assert_eq!(reply.timestamp_us, 11);

    assert!(
        queue
            .receive_timeout(Address::Client(8), Duration::from_millis(20))?
            .is_none()
    );

    queue.close()?;
    Ok(())
}

#[test]
fn closed_queue_reports_closed() -> Result<()> {
    let queue = SysvQueue::private()?;
    queue.close()?;

    assert!(matches!(
        queue.receive_timeout(Address::Control, Duration::from_millis(20)),
        Err(TransportError::Closed)
    ));
    // Removing twice is harmless.
    queue.close()?;
    Ok(())
}
