//! Timestamp acquisition.
//!
//! Four latency types are supported, each pairing a send instant with a
//! receive instant taken from a different place in the stack:
//!
//! | type           | send instant                 | receive instant            |
//! |----------------|------------------------------|----------------------------|
//! | user-to-user   | user space, before `send`    | user space, after `recv`   |
//! | KRT            | user space, before `send`    | `SO_TIMESTAMP` ancillary   |
//! | software       | `SO_TIMESTAMPING` errqueue   | `SO_TIMESTAMPING` ancillary|
//! | hardware       | NIC stamp via errqueue       | NIC stamp, ancillary       |
//!
//! All instants live on the realtime clock so that user and kernel values can
//! be subtracted from each other. Capturing never touches session state: the
//! caller decides where the returned [`Timestamp`] goes.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::socket::{Sent, Transport};

/// Upper bound on the errqueue poll for a transmit timestamp.
pub const POLL_ERRQUEUE_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

const USEC_PER_SEC: u64 = 1_000_000;

/// A wall-clock instant with microsecond resolution, as carried on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub sec: u64,
    /// Always below 1 000 000.
    pub usec: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };

    /// Current realtime instant.
    pub fn now() -> Self {
        // A clock set before 1970 reads as the epoch rather than failing.
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_duration(since_epoch)
    }

    pub fn new(sec: u64, usec: u64) -> Self {
        Self {
            sec: sec + usec / USEC_PER_SEC,
            usec: usec % USEC_PER_SEC,
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs(),
            usec: u64::from(d.subsec_micros()),
        }
    }

    pub fn from_micros(us: u64) -> Self {
        Self::new(0, us)
    }

    pub fn as_micros(&self) -> u128 {
        u128::from(self.sec) * u128::from(USEC_PER_SEC) + u128::from(self.usec)
    }

    /// Signed difference `self - earlier`, in milliseconds.
    pub fn millis_since(&self, earlier: &Timestamp) -> f64 {
        let diff = self.as_micros() as i128 - earlier.as_micros() as i128;
        diff as f64 / 1000.0
    }

    /// Saturating difference `self - earlier`, as a timestamp-shaped duration
    /// (used for the server processing-time estimate).
    pub fn saturating_sub(&self, earlier: &Timestamp) -> Timestamp {
        let us = self.as_micros().saturating_sub(earlier.as_micros());
        Timestamp::from_micros(u64::try_from(us).unwrap_or(u64::MAX))
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.as_micros() as f64 / 1000.0
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Why a timestamp could not be obtained.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The kernel did not attach the expected ancillary timestamp.
    #[error("no {0} timestamp delivered with the packet")]
    NotDelivered(LatencyType),
    /// The errqueue poll elapsed without a transmit timestamp.
    #[error("no transmit timestamp within {0:?}")]
    ErrqueueTimeout(Duration),
    /// A reply echoed a send instant that none of our transmissions carried.
    #[error("reply echoes send instant {0} of no known transmission")]
    UnmatchedEcho(Timestamp),
    #[error("timestamp I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Latency measurement technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LatencyType {
    #[default]
    UserToUser,
    /// Kernel receive timestamp.
    Krt,
    /// Kernel receive and transmit timestamps.
    Software,
    Hardware,
}

impl LatencyType {
    pub fn code(self) -> u8 {
        match self {
            LatencyType::UserToUser => 1,
            LatencyType::Krt => 2,
            LatencyType::Software => 3,
            LatencyType::Hardware => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LatencyType::UserToUser),
            2 => Some(LatencyType::Krt),
            3 => Some(LatencyType::Software),
            4 => Some(LatencyType::Hardware),
            _ => None,
        }
    }

    /// `true` when the transmit instant comes from the errqueue.
    pub fn needs_tx_errqueue(self) -> bool {
        matches!(self, LatencyType::Software | LatencyType::Hardware)
    }

    /// `true` when the receive instant comes from ancillary data.
    pub fn needs_kernel_rx(self) -> bool {
        !matches!(self, LatencyType::UserToUser)
    }

    /// Receive instant for this latency type.
    pub fn capture_rx(self, stamps: &RxStamps) -> Result<Timestamp, TimestampError> {
        if self.needs_kernel_rx() {
            stamps.kernel.ok_or(TimestampError::NotDelivered(self))
        } else {
            Ok(stamps.user)
        }
    }

    /// Send instant for this latency type.
    ///
    /// `user` is the instant stamped just before the packet was handed to the
    /// transport and `sent` what the transport reported for that send. For
    /// software/hardware types the errqueue is polled for at most
    /// [`POLL_ERRQUEUE_WAIT_TIMEOUT`] for the stamp filed under `sent.tx_key`.
    pub fn capture_tx(
        self,
        user: Timestamp,
        sent: Sent,
        transport: &dyn Transport,
    ) -> Result<Timestamp, TimestampError> {
        if !self.needs_tx_errqueue() {
            return Ok(user);
        }
        let key = sent.tx_key.ok_or(TimestampError::NotDelivered(self))?;
        transport
            .tx_timestamp(key, POLL_ERRQUEUE_WAIT_TIMEOUT)?
            .ok_or(TimestampError::ErrqueueTimeout(POLL_ERRQUEUE_WAIT_TIMEOUT))
    }
}

impl fmt::Display for LatencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LatencyType::UserToUser => "User-to-user",
            LatencyType::Krt => "KRT",
            LatencyType::Software => "Software (kernel) timestamps",
            LatencyType::Hardware => "Hardware timestamps",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for LatencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u" => Ok(LatencyType::UserToUser),
            "r" => Ok(LatencyType::Krt),
            "s" => Ok(LatencyType::Software),
            "h" => Ok(LatencyType::Hardware),
            _ => Err(format!("unknown latency type '{s}' (valid: u, r, s, h)")),
        }
    }
}

/// Instants recorded by the receive thread for one datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStamps {
    /// Taken right after the receive call returned.
    pub user: Timestamp,
    /// Ancillary timestamp, if the socket was asked for one.
    pub kernel: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalises_microseconds() {
        let ts = Timestamp::new(1, 2_500_000);
        assert_eq!(ts, Timestamp { sec: 3, usec: 500_000 });
    }

    #[test]
    fn millis_since_is_signed() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(10, 1_500);
        assert_eq!(b.millis_since(&a), 1.5);
        assert_eq!(a.millis_since(&b), -1.5);
    }

    #[test]
    fn saturating_sub_never_goes_negative() {
        let a = Timestamp::new(5, 0);
        let b = Timestamp::new(4, 999_000);
        assert_eq!(a.saturating_sub(&b), Timestamp::from_micros(1_000));
        assert_eq!(b.saturating_sub(&a), Timestamp::ZERO);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(Timestamp::now().sec > 1_577_836_800);
    }

    #[test]
    fn capture_rx_user_ignores_kernel_stamp() {
        let stamps = RxStamps {
            user: Timestamp::new(1, 0),
            kernel: Some(Timestamp::new(2, 0)),
        };
        assert_eq!(
            LatencyType::UserToUser.capture_rx(&stamps).unwrap(),
            Timestamp::new(1, 0)
        );
        assert_eq!(
            LatencyType::Krt.capture_rx(&stamps).unwrap(),
            Timestamp::new(2, 0)
        );
    }

    #[test]
    fn capture_rx_fails_without_kernel_stamp() {
        let stamps = RxStamps {
            user: Timestamp::new(1, 0),
            kernel: None,
        };
        assert!(matches!(
            LatencyType::Krt.capture_rx(&stamps),
            Err(TimestampError::NotDelivered(LatencyType::Krt))
        ));
    }

    #[test]
    fn capture_tx_needs_a_key_for_errqueue_types() {
        let udp = crate::socket::UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let user = Timestamp::new(7, 0);
        let untracked = Sent { len: 1, tx_key: None };
        assert_eq!(
            LatencyType::Krt.capture_tx(user, untracked, &udp).unwrap(),
            user
        );
        assert!(matches!(
            LatencyType::Software.capture_tx(user, untracked, &udp),
            Err(TimestampError::NotDelivered(LatencyType::Software))
        ));
    }

    #[test]
    fn latency_codes_round_trip() {
        for (letter, lt) in [
            ("u", LatencyType::UserToUser),
            ("r", LatencyType::Krt),
            ("s", LatencyType::Software),
            ("h", LatencyType::Hardware),
        ] {
            assert_eq!(LatencyType::from_code(lt.code()), Some(lt));
            assert_eq!(letter.parse::<LatencyType>(), Ok(lt));
        }
        assert_eq!(LatencyType::from_code(0), None);
        assert_eq!(LatencyType::from_code(9), None);
    }
}
