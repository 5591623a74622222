//! Session configuration, timing policies and validation.
//!
//! A [`SessionConfig`] is filled in by whoever owns argument parsing (the
//! binary, or a test) and checked once by [`SessionConfig::validate`] when a
//! client or server is constructed. After that it is never modified.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD_LEN;
use crate::timestamp::LatencyType;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default LaMP server port.
pub const DEFAULT_PORT: u16 = 46000;

/// Source port used by raw-socket clients; servers must not listen on it.
pub const CLIENT_SRCPORT: u16 = 46772;

/// Client packet period when none is given.
pub const CLIENT_DEF_INTERVAL_MS: u64 = 100;

/// Client packet count when none is given.
pub const CLIENT_DEF_NUMBER: u64 = 600;

/// Server idle timeout when none is given.
pub const SERVER_DEF_TIMEOUT_MS: u64 = 4000;

/// Floor for the server idle timeout.
pub const MIN_TIMEOUT_VAL_MS: u64 = 1000;

/// Only the .95 interval.
pub const DEF_CONFIDENCE_INTERVAL_MASK: u8 = 0b010;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Udp,
    /// UDP over a raw link-layer socket.
    RawUdp,
    /// Message-broker binding.
    Broker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    LoopbackClient,
    Server,
    LoopbackServer,
}

impl Role {
    pub fn is_client(self) -> bool {
        matches!(self, Role::Client | Role::LoopbackClient)
    }

    pub fn is_loopback(self) -> bool {
        matches!(self, Role::LoopbackClient | Role::LoopbackServer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Every DATA is answered by an ACK.
    #[default]
    PingLike,
    /// DATA only; the server measures one-way latency.
    Unidirectional,
}

impl Direction {
    pub fn code(self) -> u8 {
        match self {
            Direction::PingLike => 0,
            Direction::Unidirectional => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::PingLike),
            1 => Some(Direction::Unidirectional),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PingLike => f.write_str("ping-like"),
            Direction::Unidirectional => f.write_str("unidirectional"),
        }
    }
}

/// Follow-up flavour, one per latency type that can produce a processing
/// time estimate on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FollowupMode {
    #[default]
    Off,
    App,
    KernelRx,
    Kernel,
    Hardware,
}

impl FollowupMode {
    pub fn code(self) -> u8 {
        match self {
            FollowupMode::Off => 0,
            FollowupMode::App => 1,
            FollowupMode::KernelRx => 2,
            FollowupMode::Kernel => 3,
            FollowupMode::Hardware => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => FollowupMode::Off,
            1 => FollowupMode::App,
            2 => FollowupMode::KernelRx,
            3 => FollowupMode::Kernel,
            4 => FollowupMode::Hardware,
            _ => return None,
        })
    }

    pub fn for_latency(latency: LatencyType) -> Self {
        match latency {
            LatencyType::UserToUser => FollowupMode::App,
            LatencyType::Krt => FollowupMode::KernelRx,
            LatencyType::Software => FollowupMode::Kernel,
            LatencyType::Hardware => FollowupMode::Hardware,
        }
    }

    pub fn is_active(self) -> bool {
        self != FollowupMode::Off
    }
}

/// 802.11 access category, applied as a socket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCategory {
    Background,
    BestEffort,
    Video,
    Voice,
}

impl AccessCategory {
    /// User priority written to `SO_PRIORITY`.
    pub fn user_priority(self) -> i32 {
        match self {
            AccessCategory::Background => 1,
            AccessCategory::BestEffort => 0,
            AccessCategory::Video => 4,
            AccessCategory::Voice => 6,
        }
    }
}

impl FromStr for AccessCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BK" => Ok(AccessCategory::Background),
            "BE" => Ok(AccessCategory::BestEffort),
            "VI" => Ok(AccessCategory::Video),
            "VO" => Ok(AccessCategory::Voice),
            _ => Err(format!("unknown access category '{s}' (valid: BK, BE, VI, VO)")),
        }
    }
}

/// Which confidence intervals are reported: bit 0 = .90, bit 1 = .95,
/// bit 2 = .99.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfidenceMask(pub u8);

impl ConfidenceMask {
    pub const P90: u8 = 0b001;
    pub const P95: u8 = 0b010;
    pub const P99: u8 = 0b100;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

impl Default for ConfidenceMask {
    fn default() -> Self {
        ConfidenceMask(DEF_CONFIDENCE_INTERVAL_MASK)
    }
}

// ---------------------------------------------------------------------------
// Timing policies
// ---------------------------------------------------------------------------

/// How long to wait for one reply and how many times to (re)send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            max_attempts,
        }
    }

    /// Time from the first send until the policy gives up.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// The three named policies used by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    /// INIT / INIT-ACK handshake.
    pub init: RetryPolicy,
    /// ACK wait and END / REPORT delivery.
    pub steady: RetryPolicy,
    /// FOLLOWUP / FOLLOWUP-ACK exchange.
    pub followup: RetryPolicy,
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            init: RetryPolicy::new(100, 30),
            steady: RetryPolicy::new(200, 15),
            followup: RetryPolicy::new(100, 30),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol: Protocol,
    pub role: Role,
    /// Required for clients, ignored by servers (the INIT decides).
    pub direction: Option<Direction>,
    pub latency_type: LatencyType,
    pub followup_requested: bool,
    /// Client packet period or server idle timeout, in ms. `0` selects the
    /// role default.
    pub interval_ms: u64,
    pub packet_count: u64,
    pub payload_len: usize,
    pub dest: Option<IpAddr>,
    pub port: u16,
    /// Raw mode only.
    pub dest_mac: Option<[u8; 6]>,
    pub access_category: Option<AccessCategory>,
    pub verbose: bool,
    /// Server keeps listening after a session ends.
    pub daemon: bool,
    pub refuse_followup: bool,
    /// Server logs receptions after replying.
    pub print_after: bool,
    pub confidence_mask: ConfidenceMask,
    pub timing: TimingProfile,
}

impl SessionConfig {
    /// Configuration with every optional knob at its default.
    pub fn new(role: Role) -> Self {
        Self {
            protocol: Protocol::Udp,
            role,
            direction: None,
            latency_type: LatencyType::UserToUser,
            followup_requested: false,
            interval_ms: 0,
            packet_count: CLIENT_DEF_NUMBER,
            payload_len: 0,
            dest: None,
            port: DEFAULT_PORT,
            dest_mac: None,
            access_category: None,
            verbose: false,
            daemon: false,
            refuse_followup: false,
            print_after: false,
            confidence_mask: ConfidenceMask::default(),
            timing: TimingProfile::default(),
        }
    }

    /// Check option combinations and fill in role defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let client = self.role.is_client();

        if self.protocol == Protocol::Broker {
            if self.role.is_loopback() {
                return Err(ConfigError::BrokerLoopback);
            }
            if client && self.direction == Some(Direction::PingLike) {
                return Err(ConfigError::BrokerPingLike);
            }
            if self.latency_type != LatencyType::UserToUser {
                return Err(ConfigError::BrokerLatency);
            }
        }

        if self.protocol == Protocol::RawUdp && self.role.is_loopback() {
            return Err(ConfigError::RawLoopback);
        }

        if client {
            let direction = self.direction.ok_or(ConfigError::MissingDirection)?;
            if self.packet_count == 0 {
                return Err(ConfigError::ZeroPacketCount);
            }
            if self.role == Role::Client && self.dest.is_none() {
                return Err(ConfigError::MissingDestination);
            }
            if self.protocol == Protocol::RawUdp && self.dest_mac.is_none() {
                return Err(ConfigError::MissingDestMac);
            }
            if direction == Direction::Unidirectional {
                if self.latency_type != LatencyType::UserToUser {
                    return Err(ConfigError::UnidirectionalLatency(self.latency_type));
                }
                if self.followup_requested {
                    return Err(ConfigError::FollowupNotPingLike);
                }
            }
            if self.refuse_followup {
                return Err(ConfigError::RefuseFollowupOnClient);
            }
            if self.interval_ms == 0 {
                self.interval_ms = CLIENT_DEF_INTERVAL_MS;
            }
        } else {
            if self.latency_type.needs_tx_errqueue() {
                return Err(ConfigError::ServerLatency(self.latency_type));
            }
            if self.followup_requested {
                return Err(ConfigError::FollowupOnServer);
            }
            if self.interval_ms == 0 {
                self.interval_ms = SERVER_DEF_TIMEOUT_MS;
            } else if self.interval_ms < MIN_TIMEOUT_VAL_MS {
                log::warn!(
                    "[config] server timeout {} ms below floor; using {} ms",
                    self.interval_ms,
                    MIN_TIMEOUT_VAL_MS
                );
                self.interval_ms = MIN_TIMEOUT_VAL_MS;
            }
        }

        if self.protocol != Protocol::Broker && self.payload_len > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLarge(self.payload_len));
        }
        if self.confidence_mask.0 > 0b111 {
            return Err(ConfigError::BadConfidenceMask(self.confidence_mask.0));
        }
        if self.port == CLIENT_SRCPORT {
            log::warn!(
                "[config] port {} is reserved for raw clients; using {}",
                CLIENT_SRCPORT,
                CLIENT_SRCPORT + 1
            );
            self.port = CLIENT_SRCPORT + 1;
        }
        if self.protocol == Protocol::Udp && self.dest_mac.is_some() {
            log::warn!("[config] destination MAC ignored in UDP mode");
            self.dest_mac = None;
        }
        Ok(())
    }

    /// Direction of a client session, ping-like when unset.
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or_default()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Follow-up mode a client asks for.
    pub fn requested_followup(&self) -> FollowupMode {
        if self.followup_requested && self.direction() == Direction::PingLike {
            FollowupMode::for_latency(self.latency_type)
        } else {
            FollowupMode::Off
        }
    }

    /// Address a client sends to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let ip = match self.role {
            Role::LoopbackClient => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => self.dest?,
        };
        Some(SocketAddr::new(ip, self.port))
    }

    /// Address a server binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.role == Role::LoopbackServer {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        SocketAddr::new(IpAddr::V4(ip), self.port)
    }
}

/// An invalid combination of options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("clients must select ping-like or unidirectional mode")]
    MissingDirection,
    #[error("the packet count must be greater than zero")]
    ZeroPacketCount,
    #[error("a destination address is required in client mode")]
    MissingDestination,
    #[error("raw mode requires a destination MAC address")]
    MissingDestMac,
    #[error("raw sockets cannot be used in loopback mode")]
    RawLoopback,
    #[error("latency type '{0}' is not available in unidirectional mode")]
    UnidirectionalLatency(LatencyType),
    #[error("latency type '{0}' is client-only")]
    ServerLatency(LatencyType),
    #[error("follow-up can only be requested by a client")]
    FollowupOnServer,
    #[error("follow-up requires ping-like mode")]
    FollowupNotPingLike,
    #[error("refusing follow-up is a server option")]
    RefuseFollowupOnClient,
    #[error("payload of {0} bytes exceeds the UDP maximum of 1448")]
    PayloadTooLarge(usize),
    #[error("confidence interval mask {0:#x} out of range (0..=7)")]
    BadConfidenceMask(u8),
    #[error("the broker transport cannot be used in loopback mode")]
    BrokerLoopback,
    #[error("the broker transport supports unidirectional mode only")]
    BrokerPingLike,
    #[error("the broker transport supports user-to-user latency only")]
    BrokerLatency,
    #[error("this session type requires a {0} role")]
    WrongRole(&'static str),
    #[error("invalid MAC address '{0}'")]
    BadMac(String),
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| ConfigError::BadMac(s.into()))?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| ConfigError::BadMac(s.into()))?;
    }
    if parts.next().is_some() {
        return Err(ConfigError::BadMac(s.into()));
    }
    Ok(mac)
}
