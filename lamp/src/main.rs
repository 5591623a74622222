//! Entry point for `lamp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::IpAddr;
#[cfg(unix)]
use std::sync::atomic::{AtomicI32, Ordering};
#[cfg(unix)]
use std::thread;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use lamp::config::{
    parse_mac, AccessCategory, ConfidenceMask, Direction, Protocol, Role, SessionConfig,
    DEFAULT_PORT, DEF_CONFIDENCE_INTERVAL_MASK,
};
use lamp::server::Server;
use lamp::timer::StopSignal;
use lamp::timestamp::LatencyType;
use lamp::Client;

/// LaMP latency measurement client and server.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log every packet (debug level) unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Probe a server and print the latency report.
    Client(ClientArgs),
    /// Answer probes from clients.
    Server(ServerArgs),
}

#[derive(Args)]
#[command(group = clap::ArgGroup::new("direction").required(true))]
struct ClientArgs {
    /// Server address (not needed with --loopback).
    dest: Option<IpAddr>,

    /// Talk to a server on 127.0.0.1.
    #[arg(short, long)]
    loopback: bool,

    /// Ping-like mode: the server answers every DATA with an ACK.
    #[arg(short = 'B', long, group = "direction")]
    ping_like: bool,

    /// Unidirectional mode: the server measures one-way latency.
    #[arg(short = 'U', long, group = "direction")]
    unidirectional: bool,

    /// Latency type: u (user-to-user), r (kernel rx), s (software), h (hardware).
    #[arg(short = 'L', long, default_value = "u")]
    latency: LatencyType,

    /// Ask the server for processing-time follow-ups.
    #[arg(short = 'F', long)]
    followup: bool,

    /// Packet period in milliseconds.
    #[arg(short = 't', long, default_value_t = 0)]
    interval: u64,

    /// Number of probes to send.
    #[arg(short = 'n', long, default_value_t = lamp::config::CLIENT_DEF_NUMBER)]
    count: u64,

    /// DATA payload length in bytes.
    #[arg(short = 'P', long, default_value_t = 0)]
    payload: usize,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Destination MAC address (raw mode only).
    #[arg(short = 'M', long)]
    mac: Option<String>,

    /// 802.11 access category: BK, BE, VI or VO.
    #[arg(short = 'A', long)]
    access_category: Option<AccessCategory>,

    /// Confidence intervals to print: bit 0 = .90, bit 1 = .95, bit 2 = .99.
    #[arg(short = 'C', long, default_value_t = DEF_CONFIDENCE_INTERVAL_MASK)]
    confidence: u8,

    #[command(flatten)]
    transport: TransportArgs,
}

#[derive(Args)]
struct ServerArgs {
    /// Bind to 127.0.0.1 only.
    #[arg(short, long)]
    loopback: bool,

    /// Latency type: u (user-to-user) or r (kernel rx).
    #[arg(short = 'L', long, default_value = "u")]
    latency: LatencyType,

    /// Idle timeout in milliseconds.
    #[arg(short = 't', long, default_value_t = 0)]
    timeout: u64,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keep serving after a session ends.
    #[arg(short, long)]
    daemon: bool,

    /// Never grant follow-up mode.
    #[arg(short, long)]
    refuse_followup: bool,

    /// Log receptions after replying to them.
    #[arg(long)]
    print_after: bool,

    /// 802.11 access category: BK, BE, VI or VO.
    #[arg(short = 'A', long)]
    access_category: Option<AccessCategory>,

    #[command(flatten)]
    transport: TransportArgs,
}

#[derive(Args)]
struct TransportArgs {
    /// Use raw sockets instead of the kernel UDP stack.
    #[arg(long, conflicts_with = "broker")]
    raw: bool,

    /// Use a message broker instead of UDP.
    #[arg(long)]
    broker: bool,
}

impl TransportArgs {
    fn protocol(&self) -> Protocol {
        if self.raw {
            Protocol::RawUdp
        } else if self.broker {
            Protocol::Broker
        } else {
            Protocol::Udp
        }
    }
}

impl ClientArgs {
    fn into_config(self, verbose: bool) -> anyhow::Result<SessionConfig> {
        let role = if self.loopback {
            Role::LoopbackClient
        } else {
            Role::Client
        };
        let mut cfg = SessionConfig::new(role);
        cfg.protocol = self.transport.protocol();
        cfg.direction = Some(if self.unidirectional {
            Direction::Unidirectional
        } else {
            Direction::PingLike
        });
        cfg.latency_type = self.latency;
        cfg.followup_requested = self.followup;
        cfg.interval_ms = self.interval;
        cfg.packet_count = self.count;
        cfg.payload_len = self.payload;
        cfg.dest = self.dest;
        cfg.port = self.port;
        cfg.dest_mac = self.mac.as_deref().map(parse_mac).transpose()?;
        cfg.access_category = self.access_category;
        cfg.confidence_mask = ConfidenceMask(self.confidence);
        cfg.verbose = verbose;
        Ok(cfg)
    }
}

impl ServerArgs {
    fn into_config(self, verbose: bool) -> SessionConfig {
        let role = if self.loopback {
            Role::LoopbackServer
        } else {
            Role::Server
        };
        let mut cfg = SessionConfig::new(role);
        cfg.protocol = self.transport.protocol();
        cfg.latency_type = self.latency;
        cfg.interval_ms = self.timeout;
        cfg.port = self.port;
        cfg.daemon = self.daemon;
        cfg.refuse_followup = self.refuse_followup;
        cfg.print_after = self.print_after;
        cfg.access_category = self.access_category;
        cfg.verbose = verbose;
        cfg
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

/// Write end of the self-pipe; -1 until the handler is installed.
#[cfg(unix)]
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        // write(2) is async-signal-safe; a full pipe already holds a wakeup.
        unsafe {
            libc::write(fd, [1u8].as_ptr().cast(), 1);
        }
    }
}

/// Route SIGINT/SIGTERM to `stop`: the handler writes to a pipe and a
/// watcher thread blocks reading it.
#[cfg(unix)]
fn install_stop_handler(stop: StopSignal) -> anyhow::Result<()> {
    let [read_fd, write_fd] = signal_pipe().context("creating the signal pipe")?;
    SIGNAL_PIPE.store(write_fd, Ordering::Relaxed);
    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
    spawn_watcher(read_fd, stop)?;
    Ok(())
}

#[cfg(unix)]
fn signal_pipe() -> std::io::Result<[libc::c_int; 2]> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fds)
}

/// Block on `read_fd` and stop the session at the first byte.
#[cfg(unix)]
fn spawn_watcher(read_fd: libc::c_int, stop: StopSignal) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("lamp-signal".into())
        .spawn(move || {
            let mut byte = 0u8;
            loop {
                match unsafe { libc::read(read_fd, (&mut byte as *mut u8).cast(), 1) } {
                    n if n > 0 => break,
                    0 => return,
                    _ => {
                        let err = std::io::Error::last_os_error();
                        if err.kind() == std::io::ErrorKind::Interrupted {
                            continue;
                        }
                        log::warn!("[signal] watcher stopped: {err}");
                        return;
                    }
                }
            }
            log::info!("interrupted, stopping");
            stop.stop();
        })
        .context("spawning the signal watcher")
}

#[cfg(not(unix))]
fn install_stop_handler(_stop: StopSignal) -> anyhow::Result<()> {
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.mode {
        Mode::Server(args) => {
            let cfg = args.into_config(cli.verbose);
            let mut server = Server::bind(cfg).context("starting the server")?;
            log::info!("Listening on {}", server.local_addr()?);
            install_stop_handler(server.stop_handle())?;
            server.run()?;
        }
        Mode::Client(args) => {
            let cfg = args.into_config(cli.verbose)?;
            let client = Client::new(cfg).context("starting the client")?;
            log::info!("Probing {}", client.peer());
            install_stop_handler(client.stop_handle())?;
            let outcome = client.run();
            print!("{}", outcome.report);
            if let Some(err) = outcome.error {
                bail!("session {} failed: {err}", outcome.session_id);
            }
        }
    }
    Ok(())
}
