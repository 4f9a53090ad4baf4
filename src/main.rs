use clap::Parser;
use std::error::Error;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use btc_wire::session::{LogSink, Session, SessionConfig};
use btc_wire::wire::{Network, VarintPolicy};

/// Connects to one Bitcoin node, completes the version handshake and logs
/// every transaction and block the peer announces.
#[derive(Parser)]
#[command(name = "btc-wire", version)]
struct Cli {
    /// Host name or IP address of the peer.
    #[arg(long)]
    host: String,

    /// `main` or `test`.
    #[arg(long, default_value_t = Network::Main)]
    network: Network,

    /// Defaults to the network's standard port.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    user_agent: Option<String>,

    /// Last block height we claim to know.
    #[arg(long, default_value_t = 0)]
    height: u32,

    /// Ask the peer to announce unconfirmed transactions.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    relay: bool,

    /// Reject counts and lengths not written in their shortest form.
    #[arg(long)]
    strict_varints: bool,

    /// Read timeout in seconds; 0 waits forever.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    let port = cli.port.unwrap_or(cli.network.default_port());
    let node = format!("{}:{port}", cli.host);
    log::info!("connecting to {node} on {}", cli.network);

    let addr = node
        .to_socket_addrs()?
        .next()
        .ok_or("could not resolve address")?;

    let stream = match TcpStream::connect_timeout(&addr, Duration::from_secs(30)) {
        Ok(stream) => stream,
        Err(e) if e.kind() == ErrorKind::TimedOut => {
            log::error!("timeout connecting to {addr}");
            return Err(Box::new(e));
        }
        Err(e) => return Err(Box::new(e)),
    };

    let mut config = SessionConfig {
        network: cli.network,
        start_height: cli.height,
        relay: cli.relay,
        read_timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
        varints: if cli.strict_varints {
            VarintPolicy::Canonical
        } else {
            VarintPolicy::Lenient
        },
        ..SessionConfig::default()
    };
    if let Some(user_agent) = cli.user_agent {
        config.user_agent = user_agent;
    }

    let mut session = Session::new(stream, config)?;

    let result = session.handshake().and_then(|()| session.run(&mut LogSink));
    match result {
        Ok(()) => Ok(()),
        Err(btc_wire::Error::ConnectionReset) => {
            log::info!("peer {addr} closed the connection");
            Ok(())
        }
        Err(err) => {
            log::error!("session with {addr} failed ({:?}): {err}", err.category());
            Err(Box::new(err))
        }
    }
}
