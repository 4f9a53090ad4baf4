//! Fixed-width and CompactSize ("varint") integers.
//!
//! Everything on the wire is little-endian except the port of a `net_addr`,
//! which is why the fixed-width helpers take an explicit [`Endian`].
//!
//! CompactSize layout:
//!
//! ```text
//! value < 0xFD          -> 1 byte
//! value <= 0xFFFF       -> 0xFD + u16 LE
//! value <= 0xFFFF_FFFF  -> 0xFE + u32 LE
//! otherwise             -> 0xFF + u64 LE
//! ```
//!
//! Reference:
//! https://developer.bitcoin.org/reference/transactions.html#compactsize-unsigned-integers
use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result, eof};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Encodes `value` into exactly `width` bytes.
///
/// Fails with [`Error::ValueTooLarge`] if the value needs more than `width`
/// bytes and with [`Error::InvalidWidth`] if `width` is not in `1..=8`.
pub fn encode_fixed(value: u64, width: usize, endian: Endian) -> Result<Vec<u8>> {
    check_width(width)?;
    if width < 8 && value >> (8 * width) != 0 {
        return Err(Error::ValueTooLarge {
            value: value as u128,
            width,
        });
    }

    let mut out = vec![0u8; width];
    match endian {
        Endian::Little => LittleEndian::write_uint(&mut out, value, width),
        Endian::Big => BigEndian::write_uint(&mut out, value, width),
    }
    Ok(out)
}

/// Decodes the first `width` bytes of `bytes` as an unsigned integer.
///
/// ```
/// use btc_wire::wire::int::{decode_fixed, Endian};
///
/// assert_eq!(decode_fixed(&[0x20, 0x8d], 2, Endian::Big).unwrap(), 8333);
/// assert!(decode_fixed(&[0x01], 4, Endian::Little).is_err());
/// ```
pub fn decode_fixed(bytes: &[u8], width: usize, endian: Endian) -> Result<u64> {
    check_width(width)?;
    let field = bytes
        .get(..width)
        .ok_or(Error::TruncatedInput("fixed-width integer"))?;

    Ok(match endian {
        Endian::Little => LittleEndian::read_uint(field, width),
        Endian::Big => BigEndian::read_uint(field, width),
    })
}

fn check_width(width: usize) -> Result<()> {
    if (1..=8).contains(&width) {
        Ok(())
    } else {
        Err(Error::InvalidWidth(width))
    }
}

/// Number of bytes the shortest encoding of `value` takes.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Appends the shortest CompactSize encoding of `value` to `out`.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend(&value.to_le_bytes());
        }
    }
}

pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(value));
    write_varint(value, &mut out);
    out
}

/// Like [`encode_varint`] but accepts values wider than 64 bits, failing
/// with [`Error::ValueTooLarge`] when they cannot be represented.
pub fn encode_varint_wide(value: u128) -> Result<Vec<u8>> {
    let narrow = u64::try_from(value).map_err(|_| Error::ValueTooLarge { value, width: 8 })?;
    Ok(encode_varint(narrow))
}

/// Reads one CompactSize integer.
///
/// Any tag/width combination is accepted, including non-shortest forms.
///
/// ```
/// use std::io::Cursor;
/// use btc_wire::wire::int::read_varint;
///
/// let mut cursor = Cursor::new([0xFD, 0x01, 0x02]);
/// assert_eq!(read_varint(&mut cursor).unwrap(), 513);
/// ```
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u64> {
    let tag = reader.read_u8().map_err(eof("varint"))?;
    match tag {
        0xFD => Ok(reader.read_u16::<LittleEndian>().map_err(eof("varint:fd"))? as u64),
        0xFE => Ok(reader.read_u32::<LittleEndian>().map_err(eof("varint:fe"))? as u64),
        0xFF => reader.read_u64::<LittleEndian>().map_err(eof("varint:ff")),
        n => Ok(n as u64),
    }
}

/// Reads one CompactSize integer and rejects encodings that are not the
/// shortest form of their value.
pub fn read_canonical_varint<R: Read>(reader: &mut R) -> Result<u64> {
    let tag = reader.read_u8().map_err(eof("varint"))?;
    let (value, floor) = match tag {
        0xFD => (
            reader.read_u16::<LittleEndian>().map_err(eof("varint:fd"))? as u64,
            0xFD,
        ),
        0xFE => (
            reader.read_u32::<LittleEndian>().map_err(eof("varint:fe"))? as u64,
            0x1_0000,
        ),
        0xFF => (
            reader.read_u64::<LittleEndian>().map_err(eof("varint:ff"))?,
            0x1_0000_0000,
        ),
        n => return Ok(n as u64),
    };

    if value < floor {
        return Err(Error::NonCanonicalVarint);
    }
    Ok(value)
}

/// How payload decoders read CompactSize counts and lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarintPolicy {
    /// Any tag/width combination, like [`read_varint`].
    #[default]
    Lenient,
    /// Shortest form only, like [`read_canonical_varint`].
    Canonical,
}

impl VarintPolicy {
    pub fn read<R: Read>(self, reader: &mut R) -> Result<u64> {
        match self {
            VarintPolicy::Lenient => read_varint(reader),
            VarintPolicy::Canonical => read_canonical_varint(reader),
        }
    }
}
