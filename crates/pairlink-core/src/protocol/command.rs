//! Command codec for the open channel.
//!
//! Wire format over the negotiated channel:
//!
//! ```text
//! {"type":"<COMMAND_NAME>","ts":<integer milliseconds>}
//! ```
//!
//! The set of command names is closed.  Unknown names are rejected with
//! [`SignalingError::UnsupportedCommandType`] so protocol drift surfaces as an
//! error instead of being silently ignored.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::signaling::{parse_object, SignalingError};

/// The closed set of commands exchanged over an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Advance to the next page.
    Next,
    /// Go back to the previous page.
    Prev,
    /// Liveness probe; answered automatically with [`CommandType::Pong`].
    Ping,
    /// Liveness reply carrying the responder's clock.
    Pong,
}

impl CommandType {
    /// All command types, in wire-name order.
    pub const ALL: [CommandType; 4] = [
        CommandType::Next,
        CommandType::Prev,
        CommandType::Ping,
        CommandType::Pong,
    ];

    /// The name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            CommandType::Next => "SYNC_TEST_NEXT",
            CommandType::Prev => "SYNC_TEST_PREV",
            CommandType::Ping => "PING",
            CommandType::Pong => "PONG",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.wire_name() == name)
    }

    /// Ping and pong are handled by the channel itself and never reach
    /// generic subscribers.
    pub fn is_liveness(self) -> bool {
        matches!(self, CommandType::Ping | CommandType::Pong)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A command with the sender's timestamp in Unix epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub command_type: CommandType,
    pub ts: i64,
}

impl Command {
    pub fn new(command_type: CommandType, ts: i64) -> Self {
        Self { command_type, ts }
    }

    /// Creates a command stamped with the current wall-clock time.
    pub fn now(command_type: CommandType) -> Self {
        Self::new(command_type, now_millis())
    }
}

/// Current Unix time in milliseconds (0 if the clock is before the epoch).
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Serializes a [`Command`] as a JSON frame.
///
/// # Examples
///
/// ```rust
/// use pairlink_core::protocol::command::{decode_command, encode_command, Command, CommandType};
///
/// let cmd = Command::new(CommandType::Next, 1_735_689_600_000);
/// let frame = encode_command(&cmd);
/// assert_eq!(frame, r#"{"type":"SYNC_TEST_NEXT","ts":1735689600000}"#);
/// assert_eq!(decode_command(&frame).unwrap(), cmd);
/// ```
pub fn encode_command(command: &Command) -> String {
    let wire = CommandWire {
        kind: command.command_type.wire_name(),
        ts: command.ts,
    };
    // A name and an integer cannot fail to serialize.
    serde_json::to_string(&wire).unwrap_or_default()
}

/// Parses and validates a JSON command frame.
///
/// # Errors
///
/// - [`SignalingError::EmptyPayload`] for empty input.
/// - [`SignalingError::MalformedPayload`] if the frame is not a JSON object.
/// - [`SignalingError::UnsupportedCommandType`] if `type` is missing or not in
///   the closed command set.
/// - [`SignalingError::InvalidTimestamp`] if `ts` is missing, not a number, or
///   not finite.
pub fn decode_command(text: &str) -> Result<Command, SignalingError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SignalingError::EmptyPayload);
    }

    let record: CommandRecord = parse_object(trimmed)?;

    let command_type = match record.kind {
        Some(Value::String(name)) => CommandType::from_wire_name(&name)
            .ok_or(SignalingError::UnsupportedCommandType(name))?,
        Some(other) => return Err(SignalingError::UnsupportedCommandType(other.to_string())),
        None => {
            return Err(SignalingError::UnsupportedCommandType(
                "<missing>".to_string(),
            ))
        }
    };

    let ts = match record.ts {
        Some(Value::Number(n)) => timestamp_from_number(&n)?,
        Some(other) => return Err(SignalingError::InvalidTimestamp(other.to_string())),
        None => return Err(SignalingError::InvalidTimestamp("<missing>".to_string())),
    };

    Ok(Command::new(command_type, ts))
}

#[derive(Serialize)]
struct CommandWire {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: i64,
}

/// Fields stay loosely typed so a wrong `type` is reported as an unsupported
/// command and a wrong `ts` as an invalid timestamp, not as malformed JSON.
#[derive(Deserialize)]
struct CommandRecord {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    ts: Option<Value>,
}

fn timestamp_from_number(n: &serde_json::Number) -> Result<i64, SignalingError> {
    if let Some(ts) = n.as_i64() {
        return Ok(ts);
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Ok(f.trunc() as i64)
        }
        _ => Err(SignalingError::InvalidTimestamp(n.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip_for_every_type() {
        for t in CommandType::ALL {
            assert_eq!(CommandType::from_wire_name(t.wire_name()), Some(t));
        }
    }

    #[test]
    fn test_only_ping_and_pong_are_liveness() {
        assert!(CommandType::Ping.is_liveness());
        assert!(CommandType::Pong.is_liveness());
        assert!(!CommandType::Next.is_liveness());
        assert!(!CommandType::Prev.is_liveness());
    }

    #[test]
    fn test_decode_unknown_type_is_unsupported() {
        // Arrange
        let frame = r#"{"type":"SYNC_TEST_UNKNOWN","ts":1735689600000}"#;

        // Act
        let result = decode_command(frame);

        // Assert
        assert_eq!(
            result,
            Err(SignalingError::UnsupportedCommandType(
                "SYNC_TEST_UNKNOWN".to_string()
            ))
        );
    }

    #[test]
    fn test_decode_missing_or_non_string_type_is_unsupported() {
        for frame in [r#"{"ts":1}"#, r#"{"type":3,"ts":1}"#, r#"{"type":null,"ts":1}"#] {
            let result = decode_command(frame);
            assert!(
                matches!(result, Err(SignalingError::UnsupportedCommandType(_))),
                "{frame}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_non_numeric_timestamp_is_invalid() {
        for frame in [
            r#"{"type":"SYNC_TEST_NEXT"}"#,
            r#"{"type":"SYNC_TEST_NEXT","ts":"1735689600000"}"#,
            r#"{"type":"SYNC_TEST_NEXT","ts":null}"#,
        ] {
            let result = decode_command(frame);
            assert!(
                matches!(result, Err(SignalingError::InvalidTimestamp(_))),
                "{frame}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_fractional_timestamp_truncates() {
        let result = decode_command(r#"{"type":"SYNC_TEST_PREV","ts":1500.75}"#);
        assert_eq!(result, Ok(Command::new(CommandType::Prev, 1500)));
    }

    #[test]
    fn test_decode_invalid_json_is_malformed() {
        let result = decode_command("SYNC_TEST_NEXT 12");
        assert!(matches!(result, Err(SignalingError::MalformedPayload(_))), "{result:?}");
    }

    #[test]
    fn test_decode_empty_frame_is_empty_payload() {
        assert_eq!(decode_command("   "), Err(SignalingError::EmptyPayload));
    }

    #[test]
    fn test_now_millis_is_after_2024() {
        assert!(now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn test_encode_puts_type_before_ts() {
        let frame = encode_command(&Command::new(CommandType::Pong, -5));
        assert_eq!(frame, r#"{"type":"PONG","ts":-5}"#);
    }

    #[test]
    fn test_decode_array_form_is_malformed() {
        let result = decode_command(r#"["SYNC_TEST_NEXT",1]"#);
        assert!(matches!(result, Err(SignalingError::MalformedPayload(_))), "{result:?}");
    }
}
