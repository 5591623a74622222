//! `lamp`: the LaMP latency measurement protocol over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐    INIT / DATA / END     ┌──────────────┐
//!  │    Client    │─────────────────────────▶│    Server    │
//!  │ (tx thread)  │◀─────────────────────────│ (session FSM)│
//!  └──────┬───────┘  INIT-ACK / ACK / REPORT └──────┬───────┘
//!         │ crossbeam channel                       │ crossbeam channel
//!  ┌──────▼───────┐                          ┌──────▼───────┐
//!  │   receiver   │   decoded arrivals +     │   receiver   │
//!  │ (rx thread)  │   receive timestamps     │ (rx thread)  │
//!  └──────┬───────┘                          └──────┬───────┘
//!         │ datagrams + ancillary data              │
//!  ┌──────▼───────────────────────────────────────────▼───────┐
//!  │            Transport (UDP socket, or Simulator)          │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format (serialise / deserialise)
//! - [`timestamp`]: realtime instants and the four latency types
//! - [`socket`]: transport trait, UDP transport, kernel timestamping
//! - [`receiver`]: receive thread feeding decoded arrivals to a session
//! - [`sender`]: outstanding-probe tracking and sequence numbers
//! - [`timer`]: deadlines, retry loops and the stop signal
//! - [`state`]: client and server finite-state-machine types
//! - [`client`]: the probing side of a session
//! - [`server`]: the answering side, one session at a time
//! - [`stats`]: samples, aggregates, confidence intervals, report
//! - [`config`]: session configuration, timing profiles, validation
//! - [`error`]: error kinds shared by every module
//! - [`simulator`]: fault-injecting transport for testing

pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;
pub mod timestamp;

pub use client::{Client, SessionOutcome};
pub use config::{Direction, Role, SessionConfig};
pub use error::LampError;
pub use server::Server;
pub use stats::LatencyReport;
pub use timestamp::LatencyType;
