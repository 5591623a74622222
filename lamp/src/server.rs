//! Server session: accept an INIT, answer probes, report, repeat.
//!
//! ```text
//!  LISTENING ──INIT──▶ SERVING ──END / idle timeout──▶ LISTENING (daemon)
//!                                                 └──▶ TERMINATED
//! ```
//!
//! One receive thread lives as long as the [`Server`]; every session is
//! driven from the caller's thread through the same [`Waiter`]. Parameters
//! come from the client's INIT, never from local defaults, except that a
//! server configured to refuse follow-up grants it as off.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, Direction, FollowupMode, Protocol, SessionConfig};
use crate::error::{report_fatal, LampError};
use crate::packet::{InitParams, Packet, PacketType, ServerReport};
use crate::receiver::{self, Arrival, Diagnostics, Inbound, ReceiverHandle};
use crate::socket::{Sent, Transport, UdpTransport};
use crate::state::ServerState;
use crate::stats::Statistics;
use crate::timer::{StopSignal, Wake, Waiter};
use crate::timestamp::{LatencyType, Timestamp};

/// How long one listening wait lasts before it is re-armed.
const LISTEN_SLICE: Duration = Duration::from_secs(3600);

/// Why a served session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent END and got its REPORT.
    Completed,
    /// No packet arrived within the idle timeout.
    IdleTimeout,
}

/// Summary of one served client.
#[derive(Debug, Clone)]
pub struct ServedSession {
    pub session_id: u16,
    pub peer: SocketAddr,
    /// Parameters granted in the INIT-ACK.
    pub params: InitParams,
    /// DATA packets received.
    pub received: u64,
    pub out_of_order: u64,
    /// One-way latencies (unidirectional sessions only).
    pub one_way: Statistics,
    pub followups_sent: u64,
    pub followups_acked: u64,
    pub followups_abandoned: u64,
    pub end: SessionEnd,
}

impl ServedSession {
    pub fn report(&self) -> ServerReport {
        self.one_way.to_server_report(self.received, self.out_of_order)
    }
}

/// FOLLOWUP waiting for its FOLLOWUP-ACK.
struct PendingFollowup {
    seq: u16,
    bytes: Vec<u8>,
    attempts: u32,
    next_resend: Instant,
}

/// The last REPORT sent, for clients whose copy got lost.
struct LastReport {
    session_id: u16,
    peer: SocketAddr,
    bytes: Vec<u8>,
}

pub struct Server {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    stop: StopSignal,
    diag: Arc<Diagnostics>,
    state: ServerState,
    last_report: Option<LastReport>,
    waiter: Waiter,
    _rx_thread: ReceiverHandle,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    pub fn bind(mut config: SessionConfig) -> Result<Self, LampError> {
        config.validate()?;
        if config.role.is_client() {
            return Err(ConfigError::WrongRole("server").into());
        }
        match config.protocol {
            Protocol::Udp => {}
            Protocol::RawUdp => return Err(LampError::TransportUnavailable("raw UDP")),
            Protocol::Broker => return Err(LampError::TransportUnavailable("broker")),
        }
        let socket = UdpTransport::bind(config.bind_addr()).map_err(LampError::Bind)?;
        if let Some(ac) = config.access_category {
            socket
                .set_priority(ac.user_priority())
                .map_err(|source| LampError::SocketOption {
                    what: "SO_PRIORITY",
                    source,
                })?;
        }
        Self::start(config, Arc::new(socket))
    }

    /// Serve over an already-open transport.
    pub fn with_transport(
        mut config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, LampError> {
        config.validate()?;
        if config.role.is_client() {
            return Err(ConfigError::WrongRole("server").into());
        }
        Self::start(config, transport)
    }

    fn start(config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self, LampError> {
        transport
            .enable_timestamps(config.latency_type)
            .map_err(|source| LampError::SocketOption {
                what: "timestamping",
                source,
            })?;
        let stop = StopSignal::new();
        let diag = Arc::new(Diagnostics::default());
        let (events_tx, events) = crossbeam_channel::unbounded();
        let rx_thread = receiver::spawn(Arc::clone(&transport), None, events_tx, Arc::clone(&diag))?;
        Ok(Self {
            waiter: Waiter::new(events, &stop),
            config,
            transport,
            stop,
            diag,
            state: ServerState::Listening,
            last_report: None,
            _rx_thread: rx_thread,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diag)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Serve sessions until stopped (daemon) or after the first one.
    pub fn run(&mut self) -> Result<(), LampError> {
        loop {
            match self.serve_session() {
                Ok(served) => log::info!(
                    "[server] session {} with {} ended ({:?}): {} received, {} out of order",
                    served.session_id,
                    served.peer,
                    served.end,
                    served.received,
                    served.out_of_order
                ),
                Err(LampError::Cancelled) => {
                    log::info!("[server] stopped");
                    self.state = ServerState::Terminated;
                    return Ok(());
                }
                Err(e) => {
                    report_fatal("server", &e);
                    self.state = ServerState::Terminated;
                    return Err(e);
                }
            }
            if !self.config.daemon {
                self.state = ServerState::Terminated;
                return Ok(());
            }
        }
    }

    /// Wait for one client and serve it to the end.
    pub fn serve_session(&mut self) -> Result<ServedSession, LampError> {
        self.state = ServerState::Listening;
        let (init, peer, params) = self.listen()?;
        self.state = ServerState::Serving;
        let result = self.serve(init, peer, params);
        self.state = ServerState::Listening;
        result
    }

    // ---- LISTENING --------------------------------------------------------

    /// Block until a valid INIT arrives; answer it.
    fn listen(&mut self) -> Result<(Vec<u8>, SocketAddr, (u16, InitParams)), LampError> {
        if let Ok(addr) = self.local_addr() {
            log::info!("[server] listening on {addr}");
        }
        loop {
            let Some(arrival) = self.next_arrival(Instant::now() + LISTEN_SLICE)? else {
                continue;
            };
            match arrival.packet.kind {
                PacketType::Init => {}
                PacketType::End => {
                    self.resend_last_report(&arrival);
                    continue;
                }
                // Late follow-up acknowledgement of a finished session.
                PacketType::FollowupAck => continue,
                _ => {
                    self.diag.count_stale();
                    continue;
                }
            }

            let requested = match InitParams::from_payload(&arrival.packet.payload) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[server] ignoring INIT from {}: {e}", arrival.peer);
                    self.diag.count_stale();
                    continue;
                }
            };
            if requested.direction == Direction::Unidirectional
                && requested.latency_type != LatencyType::UserToUser
            {
                log::warn!(
                    "[server] ignoring INIT from {}: {} latency in unidirectional mode",
                    arrival.peer,
                    requested.latency_type
                );
                self.diag.count_stale();
                continue;
            }

            let granted = InitParams {
                followup: if self.config.refuse_followup
                    || requested.direction == Direction::Unidirectional
                {
                    FollowupMode::Off
                } else {
                    requested.followup
                },
                ..requested
            };
            if requested.followup.is_active() && !granted.followup.is_active() {
                log::info!("[server] refusing follow-up for {}", arrival.peer);
            }
            if let Err(e) = self.transport.enable_timestamps(granted.latency_type) {
                log::warn!(
                    "[server] {} timestamps unavailable, falling back to user stamps: {e}",
                    granted.latency_type
                );
            }

            let session_id = arrival.packet.session_id;
            let init_ack = Packet::new(PacketType::InitAck, session_id, 0)
                .with_payload(granted.to_payload())
                .encode()?;
            if let Err(e) = self.transport.send_to(&init_ack, arrival.peer) {
                log::error!("[server] cannot send INIT-ACK to {}: {e}", arrival.peer);
                continue;
            }
            log::info!(
                "[server] session {} from {} ({}, {})",
                session_id,
                arrival.peer,
                granted.direction,
                granted.latency_type
            );
            return Ok((init_ack, arrival.peer, (session_id, granted)));
        }
    }

    fn resend_last_report(&self, arrival: &Arrival) {
        match &self.last_report {
            Some(last)
                if last.session_id == arrival.packet.session_id && last.peer == arrival.peer =>
            {
                log::debug!("[server] → REPORT (again) session={}", last.session_id);
                if let Err(e) = self.transport.send_to(&last.bytes, last.peer) {
                    log::warn!("[server] cannot resend REPORT: {e}");
                }
            }
            _ => self.diag.count_stale(),
        }
    }

    // ---- SERVING ----------------------------------------------------------

    fn serve(
        &mut self,
        init_ack: Vec<u8>,
        peer: SocketAddr,
        (session_id, params): (u16, InitParams),
    ) -> Result<ServedSession, LampError> {
        let idle = self.config.interval();
        let followup_policy = self.config.timing.followup;
        let mut deadline = Instant::now() + idle;
        let mut pending: Option<PendingFollowup> = None;
        let mut last_seq: Option<u16> = None;
        let mut served = ServedSession {
            session_id,
            peer,
            params,
            received: 0,
            out_of_order: 0,
            one_way: Statistics::default(),
            followups_sent: 0,
            followups_acked: 0,
            followups_abandoned: 0,
            end: SessionEnd::IdleTimeout,
        };

        loop {
            let wake_at = pending
                .as_ref()
                .map_or(deadline, |p| p.next_resend.min(deadline));
            let Some(arrival) = self.next_arrival(wake_at)? else {
                let now = Instant::now();
                if now >= deadline {
                    log::info!(
                        "[server] session {session_id}: no packet for {} ms, closing",
                        idle.as_millis()
                    );
                    served.end = SessionEnd::IdleTimeout;
                    return Ok(served);
                }
                if let Some(p) = pending.as_mut() {
                    if p.attempts >= followup_policy.max_attempts {
                        log::warn!("[server] FOLLOWUP seq={} never acknowledged", p.seq);
                        served.followups_abandoned += 1;
                        pending = None;
                    } else {
                        p.attempts += 1;
                        p.next_resend = now + followup_policy.interval;
                        log::debug!("[server] → FOLLOWUP seq={} (attempt {})", p.seq, p.attempts);
                        if let Err(e) = self.transport.send_to(&p.bytes, peer) {
                            log::warn!("[server] FOLLOWUP seq={} not sent: {e}", p.seq);
                        }
                    }
                }
                continue;
            };

            if arrival.packet.session_id != session_id || arrival.peer != peer {
                if arrival.packet.kind == PacketType::End {
                    self.resend_last_report(&arrival);
                } else {
                    self.diag.count_foreign();
                }
                continue;
            }
            deadline = Instant::now() + idle;

            match arrival.packet.kind {
                PacketType::Init => {
                    log::debug!("[server] duplicate INIT; → INIT-ACK again");
                    if let Err(e) = self.transport.send_to(&init_ack, peer) {
                        log::warn!("[server] cannot resend INIT-ACK: {e}");
                    }
                }
                PacketType::Data => {
                    let seq = arrival.packet.seq;
                    served.received += 1;
                    match last_seq {
                        Some(last) if (seq.wrapping_sub(last) as i16) <= 0 => {
                            served.out_of_order += 1;
                        }
                        _ => last_seq = Some(seq),
                    }
                    match params.direction {
                        Direction::PingLike => {
                            if let Some(next) = self.answer_probe(&arrival, &params, &mut served) {
                                if pending.is_some() {
                                    log::debug!("[server] FOLLOWUP superseded by seq={seq}");
                                }
                                pending = Some(next);
                            }
                        }
                        Direction::Unidirectional => {
                            self.record_one_way(&arrival, &mut served);
                        }
                    }
                }
                PacketType::FollowupAck => match &pending {
                    Some(p) if p.seq == arrival.packet.seq => {
                        log::debug!("[server] ← FOLLOWUP-ACK seq={}", p.seq);
                        served.followups_acked += 1;
                        pending = None;
                    }
                    _ => self.diag.count_stale(),
                },
                PacketType::End => {
                    let report = served.report();
                    let bytes = Packet::new(PacketType::Report, session_id, arrival.packet.seq)
                        .with_payload(report.to_payload())
                        .encode()?;
                    log::debug!("[server] ← END; → REPORT session={session_id}");
                    if let Err(e) = self.transport.send_to(&bytes, peer) {
                        log::warn!("[server] cannot send REPORT: {e}");
                    }
                    self.last_report = Some(LastReport {
                        session_id,
                        peer,
                        bytes,
                    });
                    served.end = SessionEnd::Completed;
                    return Ok(served);
                }
                _ => self.diag.count_stale(),
            }
        }
    }

    /// ACK a ping-like probe; returns the FOLLOWUP to keep retransmitting.
    fn answer_probe(
        &self,
        arrival: &Arrival,
        params: &InitParams,
        served: &mut ServedSession,
    ) -> Option<PendingFollowup> {
        let packet = &arrival.packet;
        let latency = params.latency_type;
        let rx = latency.capture_rx(&arrival.stamps).unwrap_or_else(|e| {
            log::debug!("[server] {e}; using the user-space receive stamp");
            arrival.stamps.user
        });
        if !self.config.print_after {
            log_reception(packet, arrival.peer);
        }

        let ack = Packet::new(PacketType::Ack, packet.session_id, packet.seq)
            .with_timestamp(packet.timestamp)
            .with_payload(packet.payload.clone());
        let ack_user = Timestamp::now();
        let sent = match ack.encode() {
            Ok(bytes) => self
                .transport
                .send_tracked(&bytes, arrival.peer)
                .map_err(LampError::SendAck),
            Err(e) => Err(e.into()),
        };
        let sent = sent.unwrap_or_else(|e| {
            report_fatal("server", &e);
            Sent {
                len: 0,
                tx_key: None,
            }
        });
        if self.config.print_after {
            log_reception(packet, arrival.peer);
        }

        if !params.followup.is_active() {
            return None;
        }
        let tx = latency.capture_tx(ack_user, sent, &*self.transport).unwrap_or_else(|e| {
            log::debug!("[server] {e}; using the user-space send stamp");
            ack_user
        });
        let processing = tx.saturating_sub(&rx);
        let bytes = Packet::new(PacketType::Followup, packet.session_id, packet.seq)
            .with_timestamp(processing)
            .encode()
            .ok()?;
        log::debug!("[server] → FOLLOWUP seq={} proc={processing}", packet.seq);
        if let Err(e) = self.transport.send_to(&bytes, arrival.peer) {
            log::warn!("[server] FOLLOWUP seq={} not sent: {e}", packet.seq);
        }
        served.followups_sent += 1;
        Some(PendingFollowup {
            seq: packet.seq,
            bytes,
            attempts: 1,
            next_resend: Instant::now() + self.config.timing.followup.interval,
        })
    }

    fn record_one_way(&self, arrival: &Arrival, served: &mut ServedSession) {
        let packet = &arrival.packet;
        if !self.config.print_after {
            log_reception(packet, arrival.peer);
        }
        let latency_ms = arrival.stamps.user.millis_since(&packet.timestamp);
        served.one_way.push(latency_ms);
        log::debug!("[server] seq={} one-way={latency_ms:.3} ms", packet.seq);
        if self.config.print_after {
            log_reception(packet, arrival.peer);
        }
    }

    /// Next packet before `deadline`, `None` on expiry.
    fn next_arrival(&self, deadline: Instant) -> Result<Option<Arrival>, LampError> {
        match self.waiter.next_event(deadline) {
            Wake::Event(Inbound::Packet(arrival)) => Ok(Some(arrival)),
            Wake::Event(Inbound::Failed(e)) => Err(LampError::RecvGeneric(e)),
            Wake::Elapsed => Ok(None),
            Wake::Cancelled => Err(LampError::Cancelled),
            Wake::Closed => {
                log::error!("[server] receive thread exited unexpectedly");
                Err(LampError::Unknown)
            }
        }
    }
}

fn log_reception(packet: &Packet, peer: SocketAddr) {
    log::info!(
        "[server] ← DATA seq={} session={} from {} ({} bytes)",
        packet.seq,
        packet.session_id,
        peer,
        packet.payload.len()
    );
}
