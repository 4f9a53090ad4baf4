use std::fmt;
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};
use crate::wire::codec::{Envelope, double_sha256};
use crate::wire::constants::{COMMAND_SIZE, UNITS_PER_COIN};
use crate::wire::difficulty;
use crate::wire::int::VarintPolicy;

/// 32-byte hash in internal (wire) byte order.
pub type Hash256 = [u8; 32];

/// Implemented by records that can be read from a payload stream.
///
/// A decoder consumes exactly the bytes of its own record, so records can be
/// parsed back-to-back from one stream (transactions inside a block).
pub trait Decode: Sized {
    /// Reads one record, parsing counts and lengths under `varints`.
    fn decode_with<R: Read>(reader: &mut R, varints: VarintPolicy) -> Result<Self>;

    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Self::decode_with(reader, VarintPolicy::Lenient)
    }

    /// Decodes a whole message payload. Trailing bytes are tolerated.
    fn from_payload(payload: &[u8]) -> Result<Self> {
        Self::from_payload_with(payload, VarintPolicy::Lenient)
    }

    fn from_payload_with(payload: &[u8], varints: VarintPolicy) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let value = Self::decode_with(&mut cursor, varints)?;

        let consumed = cursor.position() as usize;
        if consumed < payload.len() {
            log::debug!(
                "{}: ignoring {} trailing payload bytes",
                std::any::type_name::<Self>(),
                payload.len() - consumed
            );
        }
        Ok(value)
    }
}

/// Implemented by records that serialize themselves into wire bytes.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// A decoded Bitcoin P2P message.
///
/// Commands without a registered decoder end up in [`Message::Unknown`]
/// together with their raw payload so the dispatcher can skip them.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping([u8; 8]),
    Pong([u8; 8]),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    Tx(Transaction),
    Block(Block),
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn command(&self) -> Option<Command> {
        match self {
            Message::Version(_) => Some(Command::Version),
            Message::Verack => Some(Command::Verack),
            Message::Ping(_) => Some(Command::Ping),
            Message::Pong(_) => Some(Command::Pong),
            Message::Inv(_) => Some(Command::Inv),
            Message::GetData(_) => Some(Command::GetData),
            Message::Tx(_) => Some(Command::Tx),
            Message::Block(_) => Some(Command::Block),
            Message::Unknown { .. } => None,
        }
    }

    pub fn command_name(&self) -> &str {
        match self {
            Message::Unknown { command, .. } => command,
            known => known.command().map(Command::name).unwrap_or_default(),
        }
    }

    /// Decodes a payload according to the registered strategy for `command`.
    ///
    /// Unregistered commands never fail; they become [`Message::Unknown`].
    pub fn decode(command: &[u8], payload: &[u8]) -> Result<Message> {
        Self::decode_with(command, payload, VarintPolicy::Lenient)
    }

    pub fn decode_with(command: &[u8], payload: &[u8], varints: VarintPolicy) -> Result<Message> {
        match lookup(command) {
            Ok(&(_, decode)) => decode(payload, varints),
            Err(Error::UnknownCommand(name)) => {
                log::trace!("no decoder registered for {name:?}");
                Ok(Message::Unknown {
                    command: name,
                    payload: payload.to_vec(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self> {
        Message::decode(envelope.command(), envelope.payload())
    }
}

/// Commands with a registered payload decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Inv,
    GetData,
    Tx,
    Block,
}

impl Command {
    pub const fn name(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Tx => "tx",
            Command::Block => "block",
        }
    }

    /// Returns the 12-byte command field as defined by the Bitcoin P2P protocol.
    ///
    /// The command string is ASCII and padded with zero bytes.
    pub fn as_bytes(self) -> [u8; COMMAND_SIZE] {
        let name = self.name().as_bytes();
        let mut padded = [0u8; COMMAND_SIZE];
        padded[..name.len()].copy_from_slice(name);
        padded
    }

    /// Resolves a stripped command identifier.
    pub fn from_name(name: &[u8]) -> Result<Command> {
        lookup(name).map(|&(command, _)| command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type DecodeFn = fn(&[u8], VarintPolicy) -> Result<Message>;

/// Command identifier to payload decoder. Adding a message kind means adding
/// a [`Command`] variant, a [`Message`] variant and a row here.
static REGISTRY: [(Command, DecodeFn); 8] = [
    (Command::Version, decode_version),
    (Command::Verack, decode_verack),
    (Command::Ping, decode_ping),
    (Command::Pong, decode_pong),
    (Command::Inv, decode_inv),
    (Command::GetData, decode_getdata),
    (Command::Tx, decode_tx),
    (Command::Block, decode_block),
];

fn lookup(name: &[u8]) -> Result<&'static (Command, DecodeFn)> {
    REGISTRY
        .iter()
        .find(|(command, _)| command.name().as_bytes() == name)
        .ok_or_else(|| Error::UnknownCommand(String::from_utf8_lossy(name).into_owned()))
}

fn decode_version(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    VersionMessage::from_payload_with(payload, varints).map(Message::Version)
}

fn decode_verack(_payload: &[u8], _varints: VarintPolicy) -> Result<Message> {
    Ok(Message::Verack)
}

fn decode_ping(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    <[u8; 8]>::from_payload_with(payload, varints).map(Message::Ping)
}

fn decode_pong(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    <[u8; 8]>::from_payload_with(payload, varints).map(Message::Pong)
}

fn decode_inv(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    Vec::<Inventory>::from_payload_with(payload, varints).map(Message::Inv)
}

fn decode_getdata(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    Vec::<Inventory>::from_payload_with(payload, varints).map(Message::GetData)
}

fn decode_tx(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    Transaction::from_payload_with(payload, varints).map(Message::Tx)
}

fn decode_block(payload: &[u8], varints: VarintPolicy) -> Result<Message> {
    Block::from_payload_with(payload, varints).map(Message::Block)
}

/// Network address as carried in the `version` message (no timestamp).
///
/// IPv4 addresses are written as IPv4-mapped IPv6 (`::ffff:a.b.c.d`), and the
/// port is the one big-endian field of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub services: Services,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(services: Services, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            services,
            ip: IpAddr::V4(ip),
            port,
        }
    }
}

impl Default for NetAddr {
    /// Zero-filled placeholder, as sent when the addresses are unknown.
    fn default() -> Self {
        Self::new(Services::NONE, Ipv4Addr::UNSPECIFIED, 0)
    }
}

/// The `version` handshake offer.
///
/// ```text
/// int32    version
/// uint64   services
/// int64    timestamp
/// net_addr addr_recv
/// net_addr addr_from
/// uint64   nonce
/// var_str  user_agent
/// int32    start_height
/// bool     relay
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: Services,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    /// Raw bytes as sent; peers are not required to send UTF-8.
    pub user_agent: Vec<u8>,
    pub start_height: u32,
    pub relay: bool,
}

/// Service flags as defined by the Bitcoin P2P protocol.
///
/// This is a bitfield (`u64`) transmitted in the `version` message.
/// Unknown bits are preserved.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Services(u64);

impl Services {
    pub const NONE: Services = Services(0x00);
    /// Full node, can be asked for full blocks.
    pub const NODE_NETWORK: Services = Services(0x01);
    /// Bloom-filtered connections (BIP111).
    pub const NODE_BLOOM: Services = Services(0x04);
    /// Blocks and transactions with witness data (BIP144).
    pub const NODE_WITNESS: Services = Services(0x08);
    /// Like NODE_NETWORK but only the last 288 blocks (BIP159).
    pub const NODE_NETWORK_LIMITED: Services = Services(0x0400);

    const NAMED: [(Services, &'static str); 4] = [
        (Self::NODE_NETWORK, "NODE_NETWORK"),
        (Self::NODE_BLOOM, "NODE_BLOOM"),
        (Self::NODE_WITNESS, "NODE_WITNESS"),
        (Self::NODE_NETWORK_LIMITED, "NODE_NETWORK_LIMITED"),
    ];

    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if all bits in `other` are set.
    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|&(_, name)| name)
            .collect()
    }
}

impl std::ops::BitOr for Services {
    type Output = Services;

    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

impl From<u64> for Services {
    fn from(value: u64) -> Self {
        Services::new(value)
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Services(NONE)");
        }
        write!(f, "Services({}) [0x{:016x}]", self.names().join(" | "), self.0)
    }
}

/// Inventory object types used in `inv` and `getdata` messages.
///
/// Serialized as little-endian 32-bit unsigned integers. Values outside the
/// known set are kept as [`InventoryType::Unknown`].
///
/// https://developer.bitcoin.org/reference/p2p_networking.html#data-messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    Error,
    Tx,
    Block,
    /// BIP37.
    FilteredBlock,
    /// BIP152.
    CompactBlock,
    WitnessTx,
    WitnessBlock,
    WitnessFilteredBlock,
    Unknown(u32),
}

impl InventoryType {
    pub const fn as_u32(self) -> u32 {
        match self {
            InventoryType::Error => 0,
            InventoryType::Tx => 1,
            InventoryType::Block => 2,
            InventoryType::FilteredBlock => 3,
            InventoryType::CompactBlock => 4,
            InventoryType::WitnessTx => 0x4000_0001,
            InventoryType::WitnessBlock => 0x4000_0002,
            InventoryType::WitnessFilteredBlock => 0x4000_0003,
            InventoryType::Unknown(value) => value,
        }
    }

    /// Kinds the session asks for with `getdata` after an `inv`.
    pub const fn is_requestable(self) -> bool {
        matches!(self, InventoryType::Tx | InventoryType::Block)
    }
}

impl From<u32> for InventoryType {
    fn from(value: u32) -> Self {
        match value {
            0 => InventoryType::Error,
            1 => InventoryType::Tx,
            2 => InventoryType::Block,
            3 => InventoryType::FilteredBlock,
            4 => InventoryType::CompactBlock,
            0x4000_0001 => InventoryType::WitnessTx,
            0x4000_0002 => InventoryType::WitnessBlock,
            0x4000_0003 => InventoryType::WitnessFilteredBlock,
            other => InventoryType::Unknown(other),
        }
    }
}

/// One `(kind, hash)` entry of an `inv` or `getdata` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InventoryType,
    pub hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx_hash: Hash256,
    pub prev_output_index: u32,
    pub unlock_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in satoshis.
    pub value: i64,
    pub lock_script: Vec<u8>,
}

impl TxOutput {
    pub fn btc_value(&self) -> f64 {
        self.value as f64 / UNITS_PER_COIN as f64
    }
}

/// A legacy (non-witness) serialized transaction.
///
/// https://developer.bitcoin.org/reference/transactions.html#raw-transaction-format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double SHA-256 of the serialized transaction, in wire byte order.
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// A Bitcoin block header (exactly 80 bytes on the wire).
///
/// ```text
/// 4  bytes  version
/// 32 bytes  previous block hash
/// 32 bytes  merkle root
/// 4  bytes  timestamp (Unix epoch)
/// 4  bytes  nBits (compact target encoding)
/// 4  bytes  nonce
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block ID: SHA256(SHA256(header_bytes)), in wire byte order.
    ///
    /// For human-readable display (block explorers), the bytes must be reversed.
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }

    /// Difficulty relative to the genesis target.
    pub fn difficulty(&self) -> f64 {
        difficulty::difficulty_from_bits(self.bits)
    }
}

/// A block as received in a `block` message: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Hex of a hash in display order (byte-reversed).
pub fn display_hash(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "transaction {}", display_hash(&self.txid()))?;
        writeln!(f, "  version: {}", self.version)?;
        writeln!(f, "  lock time: {}", self.lock_time)?;
        writeln!(
            f,
            "  inputs: {}, outputs: {}, total output: {:.8} BTC",
            self.inputs.len(),
            self.outputs.len(),
            self.total_output_value() as f64 / UNITS_PER_COIN as f64
        )?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(
                f,
                "  in[{i}] {}:{} script_sig {}",
                display_hash(&input.prev_tx_hash),
                input.prev_output_index,
                hex::encode(&input.unlock_script)
            )?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(
                f,
                "  out[{i}] {} sat ({} BTC) script_pubkey {}",
                output.value,
                output.btc_value(),
                hex::encode(&output.lock_script)
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "block {}", display_hash(&h.hash()))?;
        writeln!(f, "  version: {}", h.version)?;
        writeln!(f, "  previous block: {}", display_hash(&h.prev_blockhash))?;
        writeln!(f, "  merkle root: {}", display_hash(&h.merkle_root))?;
        writeln!(f, "  timestamp: {}", h.time)?;
        writeln!(f, "  bits: {:#010x} (difficulty {})", h.bits, h.difficulty())?;
        writeln!(f, "  nonce: {}", h.nonce)?;
        writeln!(f, "  transactions: {}", self.transactions.len())?;
        for tx in &self.transactions {
            write!(f, "{tx}")?;
        }
        Ok(())
    }
}

impl fmt::Display for VersionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {} {:?} agent {:?} height {} relay {}",
            self.version,
            self.services,
            String::from_utf8_lossy(&self.user_agent),
            self.start_height,
            self.relay
        )
    }
}
