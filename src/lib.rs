//! Client side of the Bitcoin P2P wire protocol.
//!
//! - [`wire`] holds the byte-level codec: integers, the message envelope and
//!   the typed payload records.
//! - [`session`] drives a single peer connection through the version
//!   handshake and then dispatches every received message.
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html
pub mod error;
pub mod session;
pub mod wire;

pub use error::{Error, ErrorCategory, Result};
