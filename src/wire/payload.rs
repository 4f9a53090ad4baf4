use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::wire::int::write_varint;
use crate::wire::message::{
    Block, BlockHeader, Encode, Inventory, Message, NetAddr, Transaction, TxInput, TxOutput,
    VersionMessage,
};

impl Encode for NetAddr {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.services.bits().to_le_bytes());
        let ip = match self.ip {
            IpAddr::V4(ipv4) => ipv4.to_ipv6_mapped().octets(),
            IpAddr::V6(ipv6) => ipv6.octets(),
        };
        out.extend(&ip);
        // IP and port are the exception, and encoded in BE
        out.extend(&self.port.to_be_bytes());
    }
}

/// Layout:
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
impl Encode for VersionMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        out.extend(&self.services.bits().to_le_bytes());
        out.extend(&self.timestamp.to_le_bytes());
        self.addr_recv.encode(out);
        self.addr_from.encode(out);
        out.extend(&self.nonce.to_le_bytes());
        write_var_bytes(&self.user_agent, out);
        out.extend(&self.start_height.to_le_bytes());
        out.push(u8::from(self.relay));
    }
}

/// Ping and pong carry the nonce unchanged.
impl Encode for [u8; 8] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(self);
    }
}

impl Encode for Inventory {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.kind.as_u32().to_le_bytes());
        out.extend(&self.hash);
    }
}

impl Encode for [Inventory] {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for item in self {
            item.encode(out);
        }
    }
}

impl Encode for TxInput {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.prev_tx_hash);
        out.extend(&self.prev_output_index.to_le_bytes());
        write_var_bytes(&self.unlock_script, out);
        out.extend(&self.sequence.to_le_bytes());
    }
}

impl Encode for TxOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.value.to_le_bytes());
        write_var_bytes(&self.lock_script, out);
    }
}

impl Encode for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        write_varint(self.inputs.len() as u64, out);
        for input in &self.inputs {
            input.encode(out);
        }
        write_varint(self.outputs.len() as u64, out);
        for output in &self.outputs {
            output.encode(out);
        }
        out.extend(&self.lock_time.to_le_bytes());
    }
}

impl Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend(&self.version.to_le_bytes());
        out.extend(&self.prev_blockhash);
        out.extend(&self.merkle_root);
        out.extend(&self.time.to_le_bytes());
        out.extend(&self.bits.to_le_bytes());
        out.extend(&self.nonce.to_le_bytes());
    }
}

impl Encode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        write_varint(self.transactions.len() as u64, out);
        for tx in &self.transactions {
            tx.encode(out);
        }
    }
}

/// The payload of a message; `verack` is empty.
impl Encode for Message {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Message::Version(version) => version.encode(out),
            Message::Verack => {}
            Message::Ping(nonce) | Message::Pong(nonce) => nonce.encode(out),
            Message::Inv(items) | Message::GetData(items) => items.encode(out),
            Message::Tx(tx) => tx.encode(out),
            Message::Block(block) => block.encode(out),
            Message::Unknown { payload, .. } => out.extend(payload),
        }
    }
}

fn write_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_varint(bytes.len() as u64, out);
    out.extend(bytes);
}

/// Builds the `getdata` that follows an `inv`.
///
/// Only transactions and blocks are requested, in announcement order. Returns
/// `None` when nothing in the announcement is requestable.
pub fn fetch_request(announced: &[Inventory]) -> Option<Message> {
    let wanted: Vec<Inventory> = announced
        .iter()
        .filter(|item| item.kind.is_requestable())
        .copied()
        .collect();

    if wanted.is_empty() {
        None
    } else {
        Some(Message::GetData(wanted))
    }
}

/// The pong answering a ping with `nonce`.
pub fn pong_for(nonce: [u8; 8]) -> Message {
    Message::Pong(nonce)
}

/// Seconds since the Unix epoch, 0 if the clock is set before it.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn random_nonce() -> u64 {
    rand::thread_rng().r#gen()
}
