//! Error kinds surfaced by a LaMP session.
//!
//! [`LampError`] keeps the phase-scoped kinds of the protocol (INIT send/timeout,
//! ACK send/timeout, generic timeout, receive failure) as separate variants so
//! callers can tell *where* a session died, not only *that* it died.
//! Malformed or foreign datagrams never become errors; the receive thread
//! counts them (see [`crate::receiver::Diagnostics`]) and moves on.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::packet::PacketError;

/// Session-level failure.
#[derive(Debug, Error)]
pub enum LampError {
    /// The receive thread vanished without reporting why.
    #[error("unknown error")]
    Unknown,

    /// A worker thread could not be created.
    #[error("cannot start the {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Raw and broker transports live outside this crate.
    #[error("the {0} transport is not available in this build")]
    TransportUnavailable(&'static str),

    #[error("cannot bind the LaMP socket: {0}")]
    Bind(#[source] io::Error),

    /// `setsockopt` / `ioctl` style failure while preparing the socket.
    #[error("cannot configure the socket ({what}): {source}")]
    SocketOption {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("cannot send INIT: {0}")]
    SendInit(#[source] io::Error),

    #[error("cannot send ACK: {0}")]
    SendAck(#[source] io::Error),

    #[error("cannot encode packet: {0}")]
    Encode(#[from] PacketError),

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("no INIT-ACK received: the server did not answer the handshake")]
    TimeoutInit,

    #[error("no ACK received for the outstanding probe")]
    TimeoutAck,

    #[error("receive failed: {0}")]
    RecvGeneric(#[source] io::Error),

    /// The peer answered the handshake with parameters we cannot honour.
    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    /// The session was stopped from outside (signal, stop handle).
    #[error("session cancelled")]
    Cancelled,
}

impl LampError {
    /// `true` for the three timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LampError::Timeout | LampError::TimeoutInit | LampError::TimeoutAck
        )
    }
}

/// Print a fatal error scoped to the thread/phase that hit it.
pub fn report_fatal(name: &str, err: &LampError) {
    log::error!("[{name}] {err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_kinds_are_recognised() {
        assert!(LampError::Timeout.is_timeout());
        assert!(LampError::TimeoutInit.is_timeout());
        assert!(LampError::TimeoutAck.is_timeout());
        assert!(!LampError::Cancelled.is_timeout());
        assert!(!LampError::Send(io::Error::other("x")).is_timeout());
    }

    #[test]
    fn display_names_the_phase() {
        let msg = LampError::TimeoutInit.to_string();
        assert!(msg.contains("INIT-ACK"), "got: {msg}");
        let msg = LampError::SendAck(io::Error::other("boom")).to_string();
        assert!(msg.contains("ACK") && msg.contains("boom"), "got: {msg}");
    }
}
