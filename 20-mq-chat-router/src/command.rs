//! Text command protocol carried in a payload's text field.
//!
//! ```text
//! join <room>
//! leave <room>
//! say <room> <text...>
//! dm <target-id> <text...>
//! online
//! help
//! ```
//!
//! The text is split into at most three parts: the verb, the first argument
//! and the rest of the line, taken verbatim (embedded spaces included).

use crate::error::CommandError;
use crate::registry::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { room: String },
    Leave { room: String },
    Say { room: String, text: String },
    Dm { target: ClientId, text: String },
    Online,
    Help,
    Unknown { verb: String },
}

impl Command {
    /// Parses one command line.
    ///
    /// Verbs are case-insensitive and `pulse` is accepted for `online`.
    /// Argument problems are reported as [`CommandError`]; an unrecognised
    /// verb is not an error here and parses to [`Command::Unknown`].
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let (verb, rest) = split_token(text);
        if verb.is_empty() {
            return Err(CommandError::Empty);
        }
        let (argument, remainder) = split_token(rest);

        match verb.to_ascii_lowercase().as_str() {
            "join" => Ok(Command::Join {
                room: single_room(argument, remainder)?,
            }),
            "leave" => Ok(Command::Leave {
                room: single_room(argument, remainder)?,
            }),
            "say" => {
                if argument.is_empty() {
                    return Err(CommandError::MissingRoom);
                }
                if remainder.is_empty() {
                    return Err(CommandError::MissingText);
                }
                Ok(Command::Say {
                    room: argument.to_string(),
                    text: remainder.to_string(),
                })
            }
            "dm" => {
                if argument.is_empty() {
                    return Err(CommandError::MissingTarget);
                }
                let target = parse_target(argument)?;
                if remainder.is_empty() {
                    return Err(CommandError::MissingText);
                }
                Ok(Command::Dm {
                    target,
                    text: remainder.to_string(),
                })
            }
            "online" | "pulse" => Ok(Command::Online),
            "help" => Ok(Command::Help),
            _ => Ok(Command::Unknown {
                verb: verb.to_string(),
            }),
        }
    }
}

/// Splits off the first whitespace-delimited token; the rest keeps its
/// inner spacing but loses surrounding whitespace.
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn single_room(argument: &str, remainder: &str) -> Result<String, CommandError> {
    if argument.is_empty() {
        return Err(CommandError::MissingRoom);
    }
    if !remainder.is_empty() {
        return Err(CommandError::UnexpectedText(remainder.to_string()));
    }
    Ok(argument.to_string())
}

fn parse_target(argument: &str) -> Result<ClientId, CommandError> {
    match argument.parse::<ClientId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(CommandError::InvalidTarget(argument.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        assert_eq!(
            Command::parse("join lobby"),
            Ok(Command::Join {
                room: "lobby".into()
            })
        );
        assert_eq!(
            Command::parse("  leave   lobby  "),
            Ok(Command::Leave {
                room: "lobby".into()
            })
        );
        assert_eq!(Command::parse("join"), Err(CommandError::MissingRoom));
        assert_eq!(
            Command::parse("join lobby now"),
            Err(CommandError::UnexpectedText("now".into()))
        );
        assert_eq!(Command::parse("leave"), Err(CommandError::MissingRoom));
    }

    #[test]
    fn test_say_keeps_embedded_spaces() {
        assert_eq!(
            Command::parse("say lobby hello   there, world"),
            Ok(Command::Say {
                room: "lobby".into(),
                text: "hello   there, world".into()
            })
        );
        assert_eq!(Command::parse("say"), Err(CommandError::MissingRoom));
        assert_eq!(Command::parse("say lobby"), Err(CommandError::MissingText));
        assert_eq!(Command::parse("say lobby   "), Err(CommandError::MissingText));
    }

    #[test]
    fn test_dm_target_validation() {
        assert_eq!(
            Command::parse("dm 1002 hi there"),
            Ok(Command::Dm {
                target: 1002,
                text: "hi there".into()
            })
        );
        assert_eq!(Command::parse("dm"), Err(CommandError::MissingTarget));
        assert_eq!(
            Command::parse("dm bob hi"),
            Err(CommandError::InvalidTarget("bob".into()))
        );
        assert_eq!(
            Command::parse("dm 0 hi"),
            Err(CommandError::InvalidTarget("0".into()))
        );
        assert_eq!(
            Command::parse("dm -3 hi"),
            Err(CommandError::InvalidTarget("-3".into()))
        );
        assert_eq!(
            Command::parse("dm 99999999999 hi"),
            Err(CommandError::InvalidTarget("99999999999".into()))
        );
        assert_eq!(Command::parse("dm 1002"), Err(CommandError::MissingText));
    }

    #[test]
    fn test_case_insensitive_verbs_and_aliases() {
        assert_eq!(Command::parse("ONLINE"), Ok(Command::Online));
        assert_eq!(Command::parse("Pulse"), Ok(Command::Online));
        assert_eq!(Command::parse("help"), Ok(Command::Help));
        assert_eq!(Command::parse("HeLp me"), Ok(Command::Help));
        assert_eq!(
            Command::parse("JOIN Lobby"),
            Ok(Command::Join {
                room: "Lobby".into()
            })
        );
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(
            Command::parse("foo bar"),
            Ok(Command::Unknown { verb: "foo".into() })
        );
        assert_eq!(Command::parse(""), Err(CommandError::Empty));
        assert_eq!(Command::parse("   \t "), Err(CommandError::Empty));
    }
}
