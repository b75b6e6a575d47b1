//! Error types shared by the router core.
//!
//! Command errors never escape a dispatch task: the dispatcher renders them
//! into an `[ERROR]` reply for the sender. Transport and pool errors are
//! logged where they happen and, for the receive loop, may stop the router.

use std::io;

use thiserror::Error;

use crate::registry::ClientId;

/// Broad classification used when logging rejected commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed command, missing or extra arguments, invalid numeric id.
    Validation,
    /// A room or client that had to exist beforehand is absent.
    NotFound,
}

/// Reasons a command is rejected. The `Display` text is what the sender sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid client ID: {0}")]
    InvalidSender(ClientId),
    #[error("Empty command")]
    Empty,
    #[error("Missing room name")]
    MissingRoom,
    #[error("Unexpected extra text after room name: {0}")]
    UnexpectedText(String),
    #[error("Missing message text")]
    MissingText,
    #[error("Missing target client ID")]
    MissingTarget,
    #[error("Invalid target client ID: {0}")]
    InvalidTarget(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Room creation failed: {0}")]
    RoomCreation(String),
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("You are not in room {0}")]
    NotMember(String),
    #[error("Target client not found: {0}")]
    TargetNotFound(ClientId),
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::RoomNotFound(_)
            | CommandError::NotMember(_)
            | CommandError::TargetNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The queue was destroyed; nothing more can be sent or received.
    #[error("message queue has been closed")]
    Closed,
    /// A blocking call was interrupted by a signal.
    #[error("queue operation interrupted")]
    Interrupted,
    #[error("address {0} is not routable")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether retrying the same operation can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::InvalidAddress(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("worker pool cannot be shut down from one of its own workers")]
    ShutdownFromWorker,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_errors_are_classified() {
        assert_eq!(
            CommandError::RoomNotFound("lobby".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CommandError::NotMember("lobby".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(CommandError::MissingRoom.kind(), ErrorKind::Validation);
        assert_eq!(
            CommandError::UnknownCommand("foo".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn messages_match_reply_texts() {
        assert_eq!(
            CommandError::RoomNotFound("lobby".into()).to_string(),
            "Room not found: lobby"
        );
        assert_eq!(
            CommandError::NotMember("lobby".into()).to_string(),
            "You are not in room lobby"
        );
        assert_eq!(
            CommandError::UnknownCommand("foo".into()).to_string(),
            "Unknown command: foo"
        );
    }

    #[test]
    fn closed_queue_is_fatal() {
        assert!(TransportError::Closed.is_fatal());
        assert!(!TransportError::Interrupted.is_fatal());
        assert!(!TransportError::Io(io::Error::other("boom")).is_fatal());
    }
}
