use std::fmt;
use std::str::FromStr;

/// Network variant a stream belongs to.
///
/// The first 4 bytes of every Bitcoin P2P message identify the
/// network and act as a message boundary marker in the TCP stream.
///
/// You can also see how Bitcoin Core maps magic values to networks
/// in `GetNetworkForMagic`:
/// https://github.com/bitcoin/bitcoin/blob/master/src/kernel/chainparams.cpp#L703-L723
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Mainnet, magic `F9 BE B4 D9`, port 8333.
    #[default]
    Main,
    /// Testnet3, magic `0B 11 09 07`, port 18333.
    Test,
}

impl Network {
    /// Magic bytes in wire order.
    pub const fn magic(self) -> [u8; 4] {
        match self {
            Network::Main => [0xF9, 0xBE, 0xB4, 0xD9],
            Network::Test => [0x0B, 0x11, 0x09, 0x07],
        }
    }

    /// Port the connection-setup collaborator uses when none is given.
    pub const fn default_port(self) -> u16 {
        match self {
            Network::Main => 8333,
            Network::Test => 18333,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            other => Err(format!("unknown network {other:?}, expected main or test")),
        }
    }
}

/// Protocol version advertised in our `version` message.
///
/// 70015 is the last version before `wtxidrelay` negotiation, so peers keep
/// announcing transactions with plain `MSG_TX` inventory entries.
///
/// You can find a list of notable versions here: https://developer.bitcoin.org/reference/p2p_networking.html#protocol-versions
pub const PROTOCOL_VERSION: i32 = 70015;

/// Width of the zero-padded command field.
pub const COMMAND_SIZE: usize = 12;

/// magic (4) + command (12) + length (4) + checksum (4).
pub const HEADER_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;

/// Size of a `net_addr` without timestamp: services (8) + ip (16) + port (2).
pub const NET_ADDR_SIZE: usize = 26;

/// `MAX_INV_SZ` in Bitcoin Core.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Compact target of the genesis block, the reference for difficulty 1.
pub const REFERENCE_BITS: u32 = 0x1d00ffff;

/// Smallest currency units per coin.
pub const UNITS_PER_COIN: i64 = 100_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_magic_and_port() {
        assert_eq!(Network::Main.magic(), [0xF9, 0xBE, 0xB4, 0xD9]);
        assert_eq!(Network::Test.magic(), [0x0B, 0x11, 0x09, 0x07]);
        assert_eq!(Network::Main.default_port(), 8333);
        assert_eq!(Network::Test.default_port(), 18333);
    }

    #[test]
    fn network_parses_from_cli_names() {
        assert_eq!("main".parse::<Network>().unwrap(), Network::Main);
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Test);
        assert!("regtest".parse::<Network>().is_err());
        assert_eq!(Network::Test.to_string(), "test");
    }
}
