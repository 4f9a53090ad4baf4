//! One peer connection: version handshake, then the receive/dispatch loop.
//!
//! A [`Session`] owns its transport exclusively. Any error raised while
//! talking to the peer closes the session (the transport is shut down and
//! dropped) and moves it to [`Phase::Closed`], from which it never leaves.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::wire::constants::PROTOCOL_VERSION;
use crate::wire::int::VarintPolicy;
use crate::wire::payload::{random_nonce, unix_timestamp};
use crate::wire::{
    Block, Envelope, Message, NetAddr, Network, Services, Transaction, VersionMessage,
    fetch_request, pong_for, read_envelope, write_envelope,
};

/// Handshake progress. Phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Connecting,
    AwaitingPeerVersion,
    AwaitingPeerAck,
    Established,
    Closed,
}

/// A byte stream a session can own.
///
/// The defaults do nothing, which is what in-memory streams want.
pub trait Transport: Read + Write {
    fn configure_timeouts(
        &self,
        _read: Option<Duration>,
        _write: Option<Duration>,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the session closes, right before the transport is dropped.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn configure_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> io::Result<()> {
        self.set_read_timeout(read)?;
        self.set_write_timeout(write)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Identity and limits used for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub network: Network,
    pub protocol_version: i32,
    pub services: Services,
    pub user_agent: String,
    /// Last block height known to us.
    pub start_height: u32,
    pub relay: bool,
    /// Fixed nonce for the version offer; random when `None`.
    pub nonce: Option<u64>,
    /// Fixed timestamp for the version offer; the current time when `None`.
    pub timestamp: Option<i64>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// How counts and lengths inside received payloads are parsed.
    pub varints: VarintPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            protocol_version: PROTOCOL_VERSION,
            services: Services::NONE,
            user_agent: concat!("/btc-wire:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            start_height: 0,
            relay: true,
            nonce: None,
            timestamp: None,
            read_timeout: Some(Duration::from_secs(5 * 60)),
            write_timeout: Some(Duration::from_secs(30)),
            varints: VarintPolicy::Lenient,
        }
    }
}

impl SessionConfig {
    /// The version offer sent when the handshake starts.
    ///
    /// Both network addresses are zero-filled placeholders.
    pub fn version_message(&self) -> VersionMessage {
        VersionMessage {
            version: self.protocol_version,
            services: self.services,
            timestamp: self.timestamp.unwrap_or_else(unix_timestamp),
            addr_recv: NetAddr::default(),
            addr_from: NetAddr::default(),
            nonce: self.nonce.unwrap_or_else(random_nonce),
            user_agent: self.user_agent.clone().into_bytes(),
            start_height: self.start_height,
            relay: self.relay,
        }
    }
}

/// Receives the transactions and blocks the dispatch loop decodes.
pub trait PayloadSink {
    fn on_transaction(&mut self, _tx: Transaction) {}

    fn on_block(&mut self, _block: Block) {}
}

/// Logs a summary of every received transaction and block at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PayloadSink for LogSink {
    fn on_transaction(&mut self, tx: Transaction) {
        log::info!("{tx}");
    }

    fn on_block(&mut self, block: Block) {
        log::info!("{block}");
    }
}

pub struct Session<S: Transport> {
    stream: Option<S>,
    config: SessionConfig,
    phase: Phase,
    peer_version: Option<VersionMessage>,
}

impl<S: Transport> Session<S> {
    /// Takes ownership of `stream` and applies the configured timeouts.
    pub fn new(stream: S, config: SessionConfig) -> Result<Self> {
        stream.configure_timeouts(config.read_timeout, config.write_timeout)?;

        Ok(Self {
            stream: Some(stream),
            config,
            phase: Phase::Connecting,
            peer_version: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// The peer's version offer, once the handshake has seen it.
    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.as_ref()
    }

    /// Runs the version handshake until the session is [`Phase::Established`].
    ///
    /// Pings are answered in every phase. Anything else that arrives out of
    /// order is logged and dropped.
    pub fn handshake(&mut self) -> Result<()> {
        match self.phase {
            Phase::Connecting => self.guard(Self::negotiate),
            Phase::Closed => Err(Error::SessionClosed),
            _ => Ok(()),
        }
    }

    /// Reads and dispatches one message.
    ///
    /// Completes the handshake first if it has not run yet.
    pub fn step<K: PayloadSink + ?Sized>(&mut self, sink: &mut K) -> Result<()> {
        match self.phase {
            Phase::Established => self.guard(|session| session.dispatch(sink)),
            Phase::Closed => Err(Error::SessionClosed),
            _ => self.handshake(),
        }
    }

    /// Dispatches messages until the peer disconnects or an error occurs.
    ///
    /// Always returns an error; the session is closed by then.
    pub fn run<K: PayloadSink + ?Sized>(&mut self, sink: &mut K) -> Result<()> {
        loop {
            self.step(sink)?;
        }
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.guard(|session| session.send_message(message))
    }

    pub fn recv(&mut self) -> Result<Message> {
        self.guard(Self::recv_message)
    }

    /// Shuts the transport down and releases it. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.close() {
                log::debug!("transport shutdown failed: {err}");
            }
            drop(stream);
        }

        if self.phase != Phase::Closed {
            log::info!("session closed after {:?}", self.phase);
            self.phase = Phase::Closed;
        }
    }

    fn negotiate(&mut self) -> Result<()> {
        let offer = self.config.version_message();
        log::debug!("offering {offer}");
        self.send_message(&Message::Version(offer))?;
        self.advance(Phase::AwaitingPeerVersion);

        while self.phase < Phase::Established {
            match self.recv_message()? {
                Message::Ping(nonce) => self.send_message(&pong_for(nonce))?,
                Message::Version(peer) if self.phase == Phase::AwaitingPeerVersion => {
                    log::info!("peer {peer}");
                    self.peer_version = Some(peer);
                    self.advance(Phase::AwaitingPeerAck);
                    self.send_message(&Message::Verack)?;
                }
                Message::Verack if self.phase == Phase::AwaitingPeerAck => {
                    self.advance(Phase::Established);
                }
                Message::Unknown { command, .. } => {
                    log::trace!("skipping {command:?} during handshake");
                }
                other => {
                    let err = Error::ProtocolSequence {
                        phase: self.phase,
                        command: other.command_name().to_string(),
                    };
                    log::warn!("{err}, dropping it");
                }
            }
        }

        log::info!("handshake with peer complete");
        Ok(())
    }

    fn dispatch<K: PayloadSink + ?Sized>(&mut self, sink: &mut K) -> Result<()> {
        match self.recv_message()? {
            Message::Ping(nonce) => self.send_message(&pong_for(nonce))?,
            Message::Inv(items) => match fetch_request(&items) {
                Some(request) => self.send_message(&request)?,
                None => log::debug!("nothing to fetch from inv of {} items", items.len()),
            },
            Message::Tx(tx) => sink.on_transaction(tx),
            Message::Block(block) => sink.on_block(block),
            Message::Unknown { command, payload } => {
                log::trace!("skipping {command:?} ({} bytes)", payload.len());
            }
            other => log::debug!("ignoring {}", other.command_name()),
        }
        Ok(())
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        let envelope = Envelope::from_message(message, self.config.network)?;
        let stream = self.stream.as_mut().ok_or(Error::SessionClosed)?;

        log::debug!(
            "sending {} ({} bytes)",
            envelope.command_name(),
            envelope.payload().len()
        );
        log::trace!("{envelope}");
        write_envelope(stream, &envelope)
    }

    fn recv_message(&mut self) -> Result<Message> {
        let network = self.config.network;
        let stream = self.stream.as_mut().ok_or(Error::SessionClosed)?;
        let envelope = read_envelope(stream, network)?;

        log::debug!(
            "received {} ({} bytes)",
            envelope.command_name(),
            envelope.payload().len()
        );
        log::trace!("{envelope}");
        Message::decode_with(envelope.command(), envelope.payload(), self.config.varints)
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "{:?} -> {next:?}", self.phase);
        log::info!("session {:?} -> {next:?}", self.phase);
        self.phase = next;
    }

    /// Runs `op` and closes the session if it fails.
    fn guard<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(err) = &result {
            log::debug!("closing session: {err}");
            self.close();
        }
        result
    }
}

impl<S: Transport> Drop for Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BlockHeader, Inventory, InventoryType, TxInput, TxOutput, encode_envelope};
    use std::cell::{Cell, RefCell};
    use std::io::Cursor;
    use std::rc::Rc;

    /// Plays back `input` and records everything written.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
        closed: Rc<Cell<bool>>,
        timeouts: Rc<Cell<Option<Timeouts>>>,
    }

    type Timeouts = (Option<Duration>, Option<Duration>);

    /// Shared view of what the session did to its `Duplex`.
    #[derive(Clone)]
    struct Tap {
        output: Rc<RefCell<Vec<u8>>>,
        closed: Rc<Cell<bool>>,
        timeouts: Rc<Cell<Option<Timeouts>>>,
    }

    impl Tap {
        fn sent(&self) -> Vec<Message> {
            let bytes = self.output.borrow().clone();
            let len = bytes.len() as u64;
            let mut cursor = Cursor::new(bytes);
            let mut messages = Vec::new();
            while cursor.position() < len {
                let envelope = read_envelope(&mut cursor, Network::Main).unwrap();
                messages.push(Message::try_from(envelope).unwrap());
            }
            messages
        }
    }

    fn duplex(input: Vec<u8>) -> (Duplex, Tap) {
        let tap = Tap {
            output: Rc::new(RefCell::new(Vec::new())),
            closed: Rc::new(Cell::new(false)),
            timeouts: Rc::new(Cell::new(None)),
        };
        let stream = Duplex {
            input: Cursor::new(input),
            output: tap.output.clone(),
            closed: tap.closed.clone(),
            timeouts: tap.timeouts.clone(),
        };
        (stream, tap)
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Duplex {
        fn configure_timeouts(
            &self,
            read: Option<Duration>,
            write: Option<Duration>,
        ) -> io::Result<()> {
            self.timeouts.set(Some((read, write)));
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            self.closed.set(true);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        txs: Vec<Transaction>,
        blocks: Vec<Block>,
    }

    impl PayloadSink for Recorder {
        fn on_transaction(&mut self, tx: Transaction) {
            self.txs.push(tx);
        }

        fn on_block(&mut self, block: Block) {
            self.blocks.push(block);
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            nonce: Some(42),
            timestamp: Some(1_700_000_000),
            ..SessionConfig::default()
        }
    }

    fn peer_version() -> VersionMessage {
        VersionMessage {
            version: 70016,
            services: Services::NODE_NETWORK | Services::NODE_WITNESS,
            timestamp: 1_700_000_100,
            addr_recv: NetAddr::default(),
            addr_from: NetAddr::default(),
            nonce: 7,
            user_agent: b"/Satoshi:27.0.0/".to_vec(),
            start_height: 840_000,
            relay: true,
        }
    }

    fn frames(messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| Envelope::from_message(m, Network::Main).unwrap().encode())
            .collect()
    }

    fn session(input: Vec<u8>) -> (Session<Duplex>, Tap) {
        let (stream, tap) = duplex(input);
        (Session::new(stream, config()).unwrap(), tap)
    }

    /// A session that has completed the handshake, with `after` queued.
    fn established(after: &[Message]) -> (Session<Duplex>, Tap) {
        let mut input = frames(&[Message::Version(peer_version()), Message::Verack]);
        input.extend(frames(after));
        let (mut session, tap) = session(input);
        session.handshake().unwrap();
        assert_eq!(session.phase(), Phase::Established);
        (session, tap)
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_tx_hash: [0; 32],
                prev_output_index: 0xFFFF_FFFF,
                unlock_script: vec![0x04, 0xFF, 0xFF, 0x00, 0x1D],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOutput {
                value: 5_000_000_000,
                lock_script: vec![0xAC],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Connecting < Phase::AwaitingPeerVersion);
        assert!(Phase::AwaitingPeerVersion < Phase::AwaitingPeerAck);
        assert!(Phase::AwaitingPeerAck < Phase::Established);
        assert!(Phase::Established < Phase::Closed);
    }

    #[test]
    fn handshake_sends_version_then_verack() {
        let input = frames(&[Message::Version(peer_version()), Message::Verack]);
        let (mut session, tap) = session(input);
        assert_eq!(session.phase(), Phase::Connecting);

        session.handshake().unwrap();

        assert_eq!(session.phase(), Phase::Established);
        assert_eq!(session.peer_version(), Some(&peer_version()));
        assert_eq!(
            tap.sent(),
            vec![
                Message::Version(config().version_message()),
                Message::Verack
            ]
        );
    }

    #[test]
    fn handshake_answers_pings_in_both_waiting_phases() {
        let input = frames(&[
            Message::Ping([1; 8]),
            Message::Version(peer_version()),
            Message::Ping([2; 8]),
            Message::Verack,
        ]);
        let (mut session, tap) = session(input);

        session.handshake().unwrap();

        let sent = tap.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1], Message::Pong([1; 8]));
        assert_eq!(sent[2], Message::Verack);
        assert_eq!(sent[3], Message::Pong([2; 8]));
    }

    #[test]
    fn out_of_phase_messages_are_dropped() {
        let inv = Message::Inv(vec![Inventory {
            kind: InventoryType::Tx,
            hash: [0x22; 32],
        }]);
        let input = frames(&[
            inv,
            Message::Verack,
            Message::Version(peer_version()),
            Message::Unknown {
                command: "sendaddrv2".to_string(),
                payload: vec![],
            },
            Message::Version(peer_version()),
            Message::Verack,
        ]);
        let (mut session, tap) = session(input);

        session.handshake().unwrap();

        assert_eq!(session.phase(), Phase::Established);
        assert_eq!(tap.sent().len(), 2);
    }

    #[test]
    fn handshake_twice_is_a_no_op() {
        let (mut session, tap) = established(&[]);
        session.handshake().unwrap();
        assert_eq!(tap.sent().len(), 2);
    }

    #[test]
    fn ping_is_answered_with_same_nonce() {
        let nonce = [0xA5, 1, 2, 3, 4, 5, 6, 7];
        let (mut session, tap) = established(&[Message::Ping(nonce)]);

        session.step(&mut Recorder::default()).unwrap();

        assert_eq!(tap.sent()[2..], [Message::Pong(nonce)]);
    }

    #[test]
    fn inv_triggers_single_getdata_in_order() {
        let items = vec![
            Inventory {
                kind: InventoryType::Block,
                hash: [0x00; 32],
            },
            Inventory {
                kind: InventoryType::Tx,
                hash: [0x11; 32],
            },
        ];
        let (mut session, tap) = established(&[Message::Inv(items.clone())]);

        session.step(&mut Recorder::default()).unwrap();

        assert_eq!(tap.sent()[2..], [Message::GetData(items)]);
    }

    #[test]
    fn inv_without_requestable_items_sends_nothing() {
        let items = vec![Inventory {
            kind: InventoryType::FilteredBlock,
            hash: [0x33; 32],
        }];
        let (mut session, tap) = established(&[Message::Inv(items)]);

        session.step(&mut Recorder::default()).unwrap();

        assert_eq!(tap.sent().len(), 2);
    }

    #[test]
    fn tx_and_block_reach_the_sink() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_blockhash: [0; 32],
                merkle_root: coinbase().txid(),
                time: 1_231_006_505,
                bits: 0x1d00ffff,
                nonce: 2_083_236_893,
            },
            transactions: vec![coinbase()],
        };
        let (mut session, _tap) =
            established(&[Message::Tx(coinbase()), Message::Block(block.clone())]);
        let mut sink = Recorder::default();

        session.step(&mut sink).unwrap();
        session.step(&mut sink).unwrap();

        assert_eq!(sink.txs, vec![coinbase()]);
        assert_eq!(sink.blocks, vec![block]);
    }

    #[test]
    fn unknown_command_is_skipped() {
        let (mut session, tap) = established(&[
            Message::Unknown {
                command: "feefilter".to_string(),
                payload: vec![0xE8, 0x03, 0, 0, 0, 0, 0, 0],
            },
            Message::Ping([9; 8]),
        ]);
        let mut sink = Recorder::default();

        session.step(&mut sink).unwrap();
        session.step(&mut sink).unwrap();

        assert_eq!(session.phase(), Phase::Established);
        assert_eq!(tap.sent()[2..], [Message::Pong([9; 8])]);
    }

    #[test]
    fn checksum_failure_closes_the_session() {
        let mut corrupt = frames(&[Message::Ping([4; 8])]);
        corrupt[20] ^= 0xFF;
        let (mut session, tap) = established(&[]);
        session.stream.as_mut().unwrap().input.get_mut().extend(corrupt);

        let err = session.step(&mut Recorder::default()).unwrap_err();

        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(session.phase(), Phase::Closed);
        assert!(tap.closed.get());
        assert!(matches!(
            session.step(&mut Recorder::default()),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session.send(&Message::Verack),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn run_ends_when_peer_disconnects() {
        let (mut session, tap) = established(&[Message::Ping([3; 8])]);

        let err = session.run(&mut LogSink).unwrap_err();

        assert!(matches!(err, Error::ConnectionReset));
        assert_eq!(session.phase(), Phase::Closed);
        assert!(tap.closed.get());
        assert_eq!(tap.sent().len(), 3);
    }

    #[test]
    fn step_drives_handshake_first() {
        let input = frames(&[Message::Version(peer_version()), Message::Verack]);
        let (mut session, _tap) = session(input);

        session.step(&mut Recorder::default()).unwrap();

        assert_eq!(session.phase(), Phase::Established);
    }

    #[test]
    fn handshake_failure_closes_the_session() {
        let mut input = frames(&[Message::Version(peer_version())]);
        input.truncate(input.len() - 3);
        let (mut session, tap) = session(input);

        let err = session.handshake().unwrap_err();

        assert!(matches!(err, Error::TruncatedPayload { .. }));
        assert_eq!(session.phase(), Phase::Closed);
        assert!(tap.closed.get());
        assert!(matches!(session.handshake(), Err(Error::SessionClosed)));
    }

    #[test]
    fn dropping_the_session_closes_the_transport() {
        let (session, tap) = established(&[]);
        assert!(!tap.closed.get());
        drop(session);
        assert!(tap.closed.get());
    }

    #[test]
    fn wrong_network_magic_is_fatal() {
        let input = Envelope::from_message(&Message::Version(peer_version()), Network::Test)
            .unwrap()
            .encode();
        let (mut session, _tap) = session(input);

        let err = session.handshake().unwrap_err();

        assert!(matches!(err, Error::MagicMismatch { .. }));
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[test]
    fn new_applies_configured_timeouts() {
        let (_session, tap) = session(Vec::new());
        assert_eq!(
            tap.timeouts.get(),
            Some((Some(Duration::from_secs(300)), Some(Duration::from_secs(30))))
        );

        let (stream, tap) = duplex(Vec::new());
        let custom = SessionConfig {
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(5)),
            ..config()
        };
        let _session = Session::new(stream, custom).unwrap();
        assert_eq!(tap.timeouts.get(), Some((None, Some(Duration::from_secs(5)))));
    }

    #[test]
    fn recv_returns_next_message_without_dispatching() {
        let items = vec![Inventory {
            kind: InventoryType::Tx,
            hash: [0x44; 32],
        }];
        let (mut session, tap) = established(&[Message::Inv(items.clone())]);

        assert_eq!(session.recv().unwrap(), Message::Inv(items));
        assert_eq!(tap.sent().len(), 2);

        assert!(matches!(session.recv(), Err(Error::ConnectionReset)));
        assert_eq!(session.phase(), Phase::Closed);
        assert!(matches!(session.recv(), Err(Error::SessionClosed)));
    }

    #[test]
    fn canonical_varints_reject_padded_counts_from_peer() {
        let mut padded = vec![0xFD, 0x01, 0x00];
        padded.extend_from_slice(&1u32.to_le_bytes());
        padded.extend_from_slice(&[0x55; 32]);

        let mut input = frames(&[Message::Version(peer_version()), Message::Verack]);
        input.extend(encode_envelope(b"inv", &padded, Network::Main).unwrap());
        let (stream, tap) = duplex(input.clone());
        let strict = SessionConfig {
            varints: VarintPolicy::Canonical,
            ..config()
        };
        let mut strict_session = Session::new(stream, strict).unwrap();
        strict_session.handshake().unwrap();

        let err = strict_session.step(&mut Recorder::default()).unwrap_err();
        assert!(matches!(err, Error::NonCanonicalVarint));
        assert_eq!(strict_session.phase(), Phase::Closed);
        assert!(tap.closed.get());

        // the default policy accepts the same bytes and asks for the item
        let (mut lenient, tap) = session(input);
        lenient.handshake().unwrap();
        lenient.step(&mut Recorder::default()).unwrap();
        assert!(matches!(&tap.sent()[2], Message::GetData(items) if items.len() == 1));
    }

    #[test]
    fn default_config_offer() {
        let offer = SessionConfig::default().version_message();
        assert_eq!(offer.version, 70015);
        assert_eq!(offer.addr_recv, NetAddr::default());
        assert!(offer.user_agent.starts_with(b"/btc-wire:"));
        assert!(offer.timestamp > 0);
    }
}
