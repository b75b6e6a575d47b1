//! What travels on the queue: the payload, reply prefixes and delivery lines.

use chrono::Utc;

use crate::registry::ClientId;
use crate::transport::Address;

/// Largest text a payload can carry; the wire buffer reserves one more byte
/// for the NUL terminator.
pub const MAX_TEXT_LEN: usize = 255;

const INFO_PREFIX: &str = "[INFO] ";
const ERROR_PREFIX: &str = "[ERROR] ";
const DELIVERY_PREFIX: &str = "[Received message from ";

pub const HELP_TEXT: &str = "Commands: join <room> | leave <room> | say <room> <text> | \
dm <client-id> <text> | online | help";

/// One fixed-size payload as it travels through the queue.
///
/// Inbound, `client_id` is the sender. Outbound, it names the client whose
/// command caused the reply, and `timestamp_us` is that command's send time
/// so the receiver can compute latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub client_id: ClientId,
    pub text: String,
    pub timestamp_us: i64,
}

impl Packet {
    pub fn new(client_id: ClientId, text: impl Into<String>, timestamp_us: i64) -> Self {
        Self {
            client_id,
            text: bounded(text.into()),
            timestamp_us,
        }
    }

    /// A command stamped with the current time.
    pub fn command(client_id: ClientId, text: impl Into<String>) -> Self {
        Self::new(client_id, text, now_micros())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Info,
    Error,
    Delivery,
}

impl ReplyKind {
    /// Labels an inbound payload by its textual prefix.
    pub fn classify(text: &str) -> Option<Self> {
        if text.starts_with(INFO_PREFIX) {
            Some(ReplyKind::Info)
        } else if text.starts_with(ERROR_PREFIX) {
            Some(ReplyKind::Error)
        } else if text.starts_with(DELIVERY_PREFIX) {
            Some(ReplyKind::Delivery)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub recipient: Address,
    pub kind: ReplyKind,
    pub text: String,
    pub timestamp_us: i64,
}

impl Reply {
    pub fn info(recipient: Address, text: impl Into<String>, timestamp_us: i64) -> Self {
        Self {
            recipient,
            kind: ReplyKind::Info,
            text: text.into(),
            timestamp_us,
        }
    }

    pub fn error(recipient: Address, text: impl Into<String>, timestamp_us: i64) -> Self {
        Self {
            recipient,
            kind: ReplyKind::Error,
            text: text.into(),
            timestamp_us,
        }
    }

    /// `text` must already be a formatted delivery line.
    pub fn delivery(recipient: Address, text: impl Into<String>, timestamp_us: i64) -> Self {
        Self {
            recipient,
            kind: ReplyKind::Delivery,
            text: text.into(),
            timestamp_us,
        }
    }

    pub fn render(&self) -> String {
        match self.kind {
            ReplyKind::Info => format!("{INFO_PREFIX}{}", self.text),
            ReplyKind::Error => format!("{ERROR_PREFIX}{}", self.text),
            ReplyKind::Delivery => self.text.clone(),
        }
    }

    pub fn into_packet(self, origin: ClientId) -> Packet {
        Packet::new(origin, self.render(), self.timestamp_us)
    }
}

pub fn room_delivery(sender: ClientId, room: &str, text: &str) -> String {
    format!("{DELIVERY_PREFIX}{sender} in room {room}]: {text}")
}

pub fn direct_delivery(sender: ClientId, target: ClientId, text: &str) -> String {
    format!("{DELIVERY_PREFIX}{sender} to {target}]: {text}")
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn latency_micros(sent_at_us: i64) -> i64 {
    now_micros() - sent_at_us
}

/// Cuts `text` to at most [`MAX_TEXT_LEN`] bytes without splitting a character.
pub fn bounded(mut text: String) -> String {
    if text.len() > MAX_TEXT_LEN {
        let mut end = MAX_TEXT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_render_with_prefixes() {
        let info = Reply::info(Address::Client(7), "Joined room lobby successfully", 1);
        assert_eq!(info.render(), "[INFO] Joined room lobby successfully");

        let error = Reply::error(Address::Client(7), "Unknown command: foo", 1);
        assert_eq!(error.render(), "[ERROR] Unknown command: foo");

        let delivery = Reply::delivery(Address::Client(7), room_delivery(1001, "lobby", "hi"), 1);
        assert_eq!(delivery.render(), "[Received message from 1001 in room lobby]: hi");
    }

    #[test]
    fn classify_recognises_every_reply_kind() {
        assert_eq!(ReplyKind::classify("[INFO] ok"), Some(ReplyKind::Info));
        assert_eq!(ReplyKind::classify("[ERROR] no"), Some(ReplyKind::Error));
        assert_eq!(
            ReplyKind::classify(&direct_delivery(1, 2, "hey")),
            Some(ReplyKind::Delivery)
        );
        assert_eq!(ReplyKind::classify("plain"), None);
    }

    #[test]
    fn packet_text_is_bounded_on_char_boundary() {
        let long = "é".repeat(200);
        let packet = Packet::new(1, long, 0);
        assert!(packet.text.len() <= MAX_TEXT_LEN);
        assert_eq!(packet.text.len(), 254);
        assert!(packet.text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn reply_packet_keeps_original_timestamp() {
        let packet = Reply::info(Address::Client(5), "hello", 42).into_packet(9);
        assert_eq!(packet, Packet::new(9, "[INFO] hello", 42));
    }
}
