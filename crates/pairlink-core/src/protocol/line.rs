//! Line protocol used over the raw-stream transport.
//!
//! Every message is one UTF-8 line terminated by `\n`:
//!
//! ```text
//! HELLO <token>          connector -> acceptor, first line
//! OK                     acceptor -> connector, token accepted
//! ERROR TOKEN            acceptor -> connector, token rejected (then close)
//! PING <ms> / PONG <ms>  liveness, either direction
//! SYNC_TEST_NEXT <ms>    navigation commands, either direction
//! MSG <text>             free-form payload, either direction
//! ```

use std::fmt;

use crate::protocol::command::{Command, CommandType};
use crate::protocol::signaling::SignalingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMessage {
    Hello { token: String },
    Ok,
    ErrorToken,
    Command(Command),
    Text(String),
}

impl LineMessage {
    pub fn hello(token: impl Into<String>) -> Self {
        LineMessage::Hello {
            token: token.into(),
        }
    }

    /// Renders the message without the trailing newline.
    ///
    /// Line breaks inside `MSG` text are replaced with spaces so the frame
    /// stays on one line.
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Parses one line (with or without its trailing newline).
    ///
    /// # Errors
    ///
    /// - [`SignalingError::EmptyPayload`] for a blank line.
    /// - [`SignalingError::MalformedPayload`] for `HELLO` without a token.
    /// - [`SignalingError::UnsupportedCommandType`] for an unknown keyword.
    /// - [`SignalingError::InvalidTimestamp`] if a command's timestamp is not an integer.
    pub fn parse(line: &str) -> Result<Self, SignalingError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(SignalingError::EmptyPayload);
        }

        match line {
            "OK" => return Ok(LineMessage::Ok),
            "ERROR TOKEN" => return Ok(LineMessage::ErrorToken),
            _ => {}
        }

        if let Some(text) = line.strip_prefix("MSG ") {
            return Ok(LineMessage::Text(text.to_string()));
        }

        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        if keyword == "HELLO" {
            let token = rest.trim();
            if token.is_empty() {
                return Err(SignalingError::MalformedPayload(
                    "HELLO without a token".to_string(),
                ));
            }
            return Ok(LineMessage::hello(token));
        }

        let command_type = CommandType::from_wire_name(keyword)
            .ok_or_else(|| SignalingError::UnsupportedCommandType(keyword.to_string()))?;
        let ts = rest
            .trim()
            .parse::<i64>()
            .map_err(|_| SignalingError::InvalidTimestamp(rest.to_string()))?;
        Ok(LineMessage::Command(Command::new(command_type, ts)))
    }
}

impl fmt::Display for LineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineMessage::Hello { token } => write!(f, "HELLO {token}"),
            LineMessage::Ok => f.write_str("OK"),
            LineMessage::ErrorToken => f.write_str("ERROR TOKEN"),
            LineMessage::Command(cmd) => write!(f, "{} {}", cmd.command_type.wire_name(), cmd.ts),
            LineMessage::Text(text) => write!(f, "MSG {}", text.replace(['\r', '\n'], " ")),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
