//! Protocol module containing the setup-blob codec, the command codec, and the
//! raw-stream line protocol.

pub mod command;
pub mod line;
pub mod signaling;

pub use command::{decode_command, encode_command, Command, CommandType};
pub use line::LineMessage;
pub use signaling::{decode_setup, encode_setup, SetupBlob, SetupKind, SignalingError};
