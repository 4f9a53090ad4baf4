use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::wire::constants::{COMMAND_SIZE, HEADER_SIZE, Network};
use crate::wire::message::{Encode, Hash256, Message};

/// A framed message: command identifier plus opaque payload, bound to a network.
///
/// ```text
/// +------------+--------------+---------------+------------+
/// | magic (4)  | command (12) | length (4 LE) | checksum(4)|
/// +------------+--------------+---------------+------------+
/// | payload (variable)                                ...  |
/// +----------------------------------------------------------
/// ```
///
/// The command is stored with its zero padding stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    command: Vec<u8>,
    payload: Vec<u8>,
    network: Network,
}

impl Envelope {
    /// Fails with [`Error::CommandTooLong`] or [`Error::PayloadTooLarge`] when
    /// the pair cannot be framed.
    pub fn new(command: &[u8], payload: Vec<u8>, network: Network) -> Result<Self> {
        if command.len() > COMMAND_SIZE {
            return Err(Error::CommandTooLong(command.len()));
        }
        payload_len(payload.len())?;

        Ok(Self {
            command: strip_padding(command).to_vec(),
            payload,
            network,
        })
    }

    pub fn from_message(message: &Message, network: Network) -> Result<Self> {
        Self::new(
            message.command_name().as_bytes(),
            message.to_bytes(),
            network,
        )
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn command_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.command)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn checksum(&self) -> [u8; 4] {
        checksum(&self.payload)
    }

    /// Full wire bytes: header followed by payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.network.magic());

        let mut command = [0u8; COMMAND_SIZE];
        command[..self.command.len()].copy_from_slice(&self.command);
        out.extend_from_slice(&command);

        // length was checked in `new`
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.checksum());
        out.extend_from_slice(&self.payload);
        out
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[envelope] command: {}, payload: {}",
            self.command_name(),
            hex::encode(&self.payload)
        )
    }
}

/// Frames `command` and `payload` for `network`.
///
/// ```
/// use btc_wire::wire::codec::encode_envelope;
/// use btc_wire::wire::Network;
///
/// let bytes = encode_envelope(b"verack", &[], Network::Main).unwrap();
/// assert_eq!(bytes.len(), 24);
/// assert_eq!(&bytes[..4], &[0xF9, 0xBE, 0xB4, 0xD9]);
/// ```
pub fn encode_envelope(command: &[u8], payload: &[u8], network: Network) -> Result<Vec<u8>> {
    Ok(Envelope::new(command, payload.to_vec(), network)?.encode())
}

/// Writes a complete envelope to the given writer and flushes it.
///
/// # Errors
///
/// Returns an error if writing to the underlying stream fails.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    writer.write_all(&envelope.network.magic())?;

    let mut command = [0u8; COMMAND_SIZE];
    command[..envelope.command.len()].copy_from_slice(&envelope.command);
    writer.write_all(&command)?;

    writer.write_u32::<LittleEndian>(payload_len(envelope.payload.len())?)?;
    writer.write_all(&envelope.checksum())?;
    writer.write_all(&envelope.payload)?;
    writer.flush()?;

    Ok(())
}

/// Reads one envelope from `reader`, blocking until it is complete.
///
/// This function:
/// 1. Reads and checks the 4 magic bytes (an immediate end of stream is
///    reported as [`Error::ConnectionReset`])
/// 2. Reads the command, stripping its zero padding
/// 3. Reads the length and checksum fields
/// 4. Reads exactly `length` payload bytes and verifies the checksum
///
/// # Example
///
/// ```
/// use std::io::Cursor;
/// use btc_wire::wire::codec::{encode_envelope, read_envelope};
/// use btc_wire::wire::Network;
///
/// let bytes = encode_envelope(b"ping", &[7u8; 8], Network::Test).unwrap();
/// let envelope = read_envelope(&mut Cursor::new(bytes), Network::Test).unwrap();
///
/// assert_eq!(envelope.command(), b"ping");
/// assert_eq!(envelope.payload(), &[7u8; 8]);
/// ```
pub fn read_envelope<R: Read>(reader: &mut R, network: Network) -> Result<Envelope> {
    let magic = read_magic(reader)?;
    if magic != network.magic() {
        return Err(Error::MagicMismatch {
            expected: network.magic(),
            actual: magic,
        });
    }

    let mut command = [0u8; COMMAND_SIZE];
    reader.read_exact(&mut command).map_err(header_eof)?;
    let length = reader.read_u32::<LittleEndian>().map_err(header_eof)?;
    let mut expected = [0u8; 4];
    reader.read_exact(&mut expected).map_err(header_eof)?;

    // Read incrementally so a hostile length cannot force a huge allocation
    // before any payload byte arrived.
    let mut payload = Vec::new();
    let received = reader
        .by_ref()
        .take(u64::from(length))
        .read_to_end(&mut payload)?;
    if received < length as usize {
        return Err(Error::TruncatedPayload {
            expected: length,
            received: received as u64,
        });
    }

    let actual = checksum(&payload);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(Envelope {
        command: strip_padding(&command).to_vec(),
        payload,
        network,
    })
}

fn read_magic<R: Read>(reader: &mut R) -> Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    let mut filled = 0;

    while filled < magic.len() {
        match reader.read(&mut magic[filled..]) {
            Ok(0) if filled == 0 => return Err(Error::ConnectionReset),
            Ok(0) => return Err(Error::TruncatedHeader),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Ok(magic)
}

fn header_eof(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::TruncatedHeader
    } else {
        Error::Io(err)
    }
}

fn strip_padding(command: &[u8]) -> &[u8] {
    let end = command
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    &command[..end]
}

fn payload_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::PayloadTooLarge(len))
}

/// SHA256(SHA256(data)).
///
/// Used for the envelope checksum, block hashes and transaction ids.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

/// First 4 bytes of [`double_sha256`] of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}
