use std::io::{self, Read};
use std::net::{IpAddr, Ipv6Addr};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result, eof};
use crate::wire::constants::MAX_INV_ENTRIES;
use crate::wire::int::VarintPolicy;
use crate::wire::message::{
    Block, BlockHeader, Decode, Hash256, Inventory, InventoryType, NetAddr, Services, Transaction,
    TxInput, TxOutput, VersionMessage,
};

/// Upper bound for up-front `Vec` capacity taken from a wire count.
const PREALLOC_LIMIT: u64 = 1024;

impl Decode for VersionMessage {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let version = r.read_i32::<LittleEndian>().map_err(eof("version: version"))?;
        let services = r
            .read_u64::<LittleEndian>()
            .map_err(eof("version: services"))?;
        let timestamp = r.read_i64::<LittleEndian>().map_err(eof("version: timestamp"))?;
        let addr_recv = NetAddr::decode_with(r, varints)?;
        let addr_from = NetAddr::decode_with(r, varints)?;
        let nonce = r.read_u64::<LittleEndian>().map_err(eof("version: nonce"))?;

        let user_agent = read_var_bytes(r, varints, "version: user_agent")?;

        let start_height = r
            .read_u32::<LittleEndian>()
            .map_err(eof("version: start_height"))?;

        // BIP37: a missing relay byte means the peer wants transactions relayed.
        let relay = match r.read_u8() {
            Ok(byte) => byte != 0,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => true,
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(VersionMessage {
            version,
            services: Services::from(services),
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

impl Decode for NetAddr {
    fn decode_with<R: Read>(r: &mut R, _varints: VarintPolicy) -> Result<Self> {
        let services = r
            .read_u64::<LittleEndian>()
            .map_err(eof("net_addr: services"))?;

        let mut ip_bytes = [0u8; 16];
        r.read_exact(&mut ip_bytes).map_err(eof("net_addr: ip"))?;
        let ipv6 = Ipv6Addr::from(ip_bytes);
        let ip = match ipv6.to_ipv4_mapped() {
            Some(ipv4) => IpAddr::V4(ipv4),
            None => IpAddr::V6(ipv6),
        };

        let port = r.read_u16::<BigEndian>().map_err(eof("net_addr: port"))?;

        Ok(NetAddr {
            services: Services::from(services),
            ip,
            port,
        })
    }
}

/// Ping and pong nonces are opaque 8-byte values.
impl Decode for [u8; 8] {
    fn decode_with<R: Read>(r: &mut R, _varints: VarintPolicy) -> Result<Self> {
        let mut nonce = [0u8; 8];
        r.read_exact(&mut nonce).map_err(eof("nonce"))?;
        Ok(nonce)
    }
}

impl Decode for Inventory {
    fn decode_with<R: Read>(r: &mut R, _varints: VarintPolicy) -> Result<Self> {
        let kind = InventoryType::from(r.read_u32::<LittleEndian>().map_err(eof("inv: type"))?);
        let hash = read_hash(r, "inv: hash")?;
        Ok(Inventory { kind, hash })
    }
}

impl Decode for Vec<Inventory> {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let count = varints.read(r)?;
        if count > MAX_INV_ENTRIES {
            return Err(Error::LimitExceeded {
                what: "inv",
                count,
                limit: MAX_INV_ENTRIES,
            });
        }

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(Inventory::decode_with(r, varints)?);
        }
        Ok(items)
    }
}

impl Decode for TxInput {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let prev_tx_hash = read_hash(r, "txin: prev_tx_hash")?;
        let prev_output_index = r
            .read_u32::<LittleEndian>()
            .map_err(eof("txin: prev_output_index"))?;
        let unlock_script = read_var_bytes(r, varints, "txin: script_sig")?;
        let sequence = r.read_u32::<LittleEndian>().map_err(eof("txin: sequence"))?;

        Ok(TxInput {
            prev_tx_hash,
            prev_output_index,
            unlock_script,
            sequence,
        })
    }
}

impl Decode for TxOutput {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let value = r.read_i64::<LittleEndian>().map_err(eof("txout: value"))?;
        let lock_script = read_var_bytes(r, varints, "txout: script_pubkey")?;
        Ok(TxOutput { value, lock_script })
    }
}

impl Decode for Transaction {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let version = r.read_i32::<LittleEndian>().map_err(eof("tx: version"))?;

        let input_count = varints.read(r)?;
        let mut inputs = Vec::with_capacity(bounded(input_count));
        for _ in 0..input_count {
            inputs.push(TxInput::decode_with(r, varints)?);
        }

        let output_count = varints.read(r)?;
        let mut outputs = Vec::with_capacity(bounded(output_count));
        for _ in 0..output_count {
            outputs.push(TxOutput::decode_with(r, varints)?);
        }

        let lock_time = r.read_u32::<LittleEndian>().map_err(eof("tx: lock_time"))?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

impl Decode for BlockHeader {
    fn decode_with<R: Read>(r: &mut R, _varints: VarintPolicy) -> Result<Self> {
        let version = r.read_i32::<LittleEndian>().map_err(eof("block: version"))?;
        let prev_blockhash = read_hash(r, "block: prev_blockhash")?;
        let merkle_root = read_hash(r, "block: merkle_root")?;
        let time = r.read_u32::<LittleEndian>().map_err(eof("block: time"))?;
        let bits = r.read_u32::<LittleEndian>().map_err(eof("block: bits"))?;
        let nonce = r.read_u32::<LittleEndian>().map_err(eof("block: nonce"))?;

        Ok(BlockHeader {
            version,
            prev_blockhash,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }
}

/// The transaction list is not length-prefixed as a whole: every transaction
/// is parsed straight off the same stream right after the previous one.
impl Decode for Block {
    fn decode_with<R: Read>(r: &mut R, varints: VarintPolicy) -> Result<Self> {
        let header = BlockHeader::decode_with(r, varints)?;

        let tx_count = varints.read(r)?;
        let mut transactions = Vec::with_capacity(bounded(tx_count));
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_with(r, varints)?);
        }

        Ok(Block {
            header,
            transactions,
        })
    }
}

fn bounded(count: u64) -> usize {
    count.min(PREALLOC_LIMIT) as usize
}

fn read_hash<R: Read>(r: &mut R, context: &'static str) -> Result<Hash256> {
    let mut hash = [0u8; 32];
    r.read_exact(&mut hash).map_err(eof(context))?;
    Ok(hash)
}

/// Reads a varint length followed by that many bytes.
fn read_var_bytes<R: Read>(
    r: &mut R,
    varints: VarintPolicy,
    context: &'static str,
) -> Result<Vec<u8>> {
    let len = varints.read(r)?;

    let mut bytes = Vec::new();
    let read = r.by_ref().take(len).read_to_end(&mut bytes)?;
    if (read as u64) < len {
        return Err(Error::TruncatedInput(context));
    }
    Ok(bytes)
}
