//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`link`** – The frame link every transport hands to the message
//!   channel, plus the pump that moves `\n`-terminated lines between a link
//!   and a TCP stream.
//!
//! - **`local_addr`** – Finds the LAN address a listener advertises when it
//!   is bound to the unspecified address.

pub mod link;
pub mod local_addr;

pub use link::{Frame, FrameLink, Framing, LinkHandle, LinkState, MAX_FRAME_LEN};
pub use local_addr::local_ipv4;
