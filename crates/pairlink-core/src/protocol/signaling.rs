//! Setup-blob codec.
//!
//! A setup blob is the connectivity payload a device relays to its peer out of
//! band (pasted, scanned, or typed).  Wire format:
//!
//! ```text
//! {"type":"offer"|"answer","sdp":"<opaque negotiation payload>"}
//! ```
//!
//! Decoding validates in a fixed order so callers get the most specific error:
//! empty input, then JSON shape (an object whose fields have the right types),
//! then the blob kind, then the payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding setup blobs and command frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The input was empty or whitespace only.
    #[error("payload is empty; paste a {{\"type\":\"offer|answer\",\"sdp\":\"...\"}} blob")]
    EmptyPayload,

    /// The input is not the expected JSON shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A well-formed blob of the other kind was supplied.
    #[error("expected an {expected} blob, got an {found} blob")]
    TypeMismatch { expected: SetupKind, found: SetupKind },

    /// A command frame named a type outside the closed command set.
    #[error("unsupported command type: {0}")]
    UnsupportedCommandType(String),

    /// A command frame carried a missing or non-finite timestamp.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// The two kinds of setup blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupKind {
    Offer,
    Answer,
}

impl SetupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupKind::Offer => "offer",
            SetupKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SetupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated setup blob.
///
/// Fields are private so a blob cannot be altered after construction; a new
/// negotiation step always produces a new blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupBlob {
    kind: SetupKind,
    payload: String,
}

impl SetupBlob {
    pub fn new(kind: SetupKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn offer(payload: impl Into<String>) -> Self {
        Self::new(SetupKind::Offer, payload)
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self::new(SetupKind::Answer, payload)
    }

    pub fn kind(&self) -> SetupKind {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Serializes a [`SetupBlob`] into its transport-safe text form.
///
/// The output is deterministic (`type` first, then `sdp`) and decodes back
/// into an equal blob.
///
/// # Examples
///
/// ```rust
/// use pairlink_core::protocol::signaling::{decode_setup, encode_setup, SetupBlob, SetupKind};
///
/// let blob = SetupBlob::offer("v=0");
/// let text = encode_setup(&blob);
/// assert_eq!(text, r#"{"type":"offer","sdp":"v=0"}"#);
/// assert_eq!(decode_setup(&text, SetupKind::Offer).unwrap(), blob);
/// ```
pub fn encode_setup(blob: &SetupBlob) -> String {
    let wire = SetupWire {
        kind: blob.kind,
        sdp: &blob.payload,
    };
    // A kind and a string cannot fail to serialize.
    serde_json::to_string(&wire).unwrap_or_default()
}

/// Parses and validates a setup blob of the `expected` kind.
///
/// # Errors
///
/// - [`SignalingError::EmptyPayload`] if `text` is empty or whitespace only.
/// - [`SignalingError::MalformedPayload`] if `text` is not a JSON object with a
///   known `type` and a non-blank `sdp` string.
/// - [`SignalingError::TypeMismatch`] if the blob is of the other kind.
pub fn decode_setup(text: &str, expected: SetupKind) -> Result<SetupBlob, SignalingError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SignalingError::EmptyPayload);
    }

    let record: SetupRecord = parse_object(trimmed)?;

    let found = record.kind.ok_or_else(|| {
        SignalingError::MalformedPayload("\"type\" must be \"offer\" or \"answer\"".to_string())
    })?;
    if found != expected {
        return Err(SignalingError::TypeMismatch { expected, found });
    }

    let sdp = record
        .sdp
        .filter(|sdp| !sdp.trim().is_empty())
        .ok_or_else(|| SignalingError::MalformedPayload("missing \"sdp\" field".to_string()))?;

    Ok(SetupBlob::new(found, sdp))
}

// ── Wire records ──────────────────────────────────────────────────────────────

/// Outbound shape; field order is the wire order.
#[derive(Serialize)]
struct SetupWire<'a> {
    #[serde(rename = "type")]
    kind: SetupKind,
    sdp: &'a str,
}

/// Inbound shape.  Fields are optional so absence is reported by the
/// validation above rather than as a parse error.
#[derive(Deserialize)]
struct SetupRecord {
    #[serde(rename = "type", default)]
    kind: Option<SetupKind>,
    #[serde(default)]
    sdp: Option<String>,
}

/// Deserializes `text` into a wire record.  Only JSON objects are accepted,
/// not the array form serde would otherwise allow for structs.  Shared with
/// the command codec.
pub(crate) fn parse_object<T>(text: &str) -> Result<T, SignalingError>
where
    T: for<'de> Deserialize<'de>,
{
    if !text.starts_with('{') {
        return Err(SignalingError::MalformedPayload(
            "expected a JSON object".to_string(),
        ));
    }
    serde_json::from_str(text)
        .map_err(|e| SignalingError::MalformedPayload(format!("invalid JSON: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
