//! Bitcoin P2P wire protocol primitives.
//!
//! This module provides the blocking codec used by [`crate::session`]:
//! - Fixed-width and CompactSize integers ([`int`])
//! - The 24-byte envelope header, payload framing and checksum ([`codec`])
//! - Typed payload records and the command registry ([`message`])
//! - Decoders and encoders for those records ([`decode`], [`payload`])
//!
//! Everything reads from any `std::io::Read` and writes to any
//! `std::io::Write`, so a `TcpStream` and an in-memory cursor are
//! interchangeable.
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html
pub mod codec;
pub mod constants;
pub mod difficulty;
pub mod int;

pub mod decode;
pub mod message;
pub mod payload;

pub use codec::{Envelope, encode_envelope, read_envelope, write_envelope};
pub use constants::Network;
pub use int::VarintPolicy;
pub use message::{
    Block, BlockHeader, Command, Decode, Encode, Inventory, InventoryType, Message, NetAddr,
    Services, Transaction, TxInput, TxOutput, VersionMessage,
};
pub use payload::{fetch_request, pong_for};
