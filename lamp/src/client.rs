//! Client session: handshake, probing, follow-up and report collection.
//!
//! # Thread layout
//!
//! ```text
//!   Client::run (session thread)              lamp-rx (receiver thread)
//!   ──────────────────────────────            ─────────────────────────
//!   INIT ──────────────────────────▶ wire
//!   await_reply ◀──── Inbound ─────────────── recv_from + stamp + decode
//!   DATA(seq) ─────────────────────▶ wire
//!   await_reply ◀──── ACK(seq) ────────────── ...
//!   [await FOLLOWUP, send FOLLOWUP-ACK]
//!   ... packet_count times ...
//!   END ───────────────────────────▶ wire
//!   await_reply ◀──── REPORT ──────────────── ...
//! ```
//!
//! The session thread owns every state transition. The receive thread only
//! reports what arrived; it never decides what the session is waiting for.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{ConfigError, Direction, FollowupMode, Protocol, SessionConfig};
use crate::error::{report_fatal, LampError};
use crate::packet::{pattern_payload, InitParams, Packet, PacketType, ServerReport};
use crate::receiver::{self, Arrival, Diagnostics};
use crate::sender::ProbeTracker;
use crate::socket::{Transport, UdpTransport};
use crate::state::ClientState;
use crate::stats::{LatencyReport, Sample};
use crate::timer::{await_passive, await_reply, Phase, StopSignal, Waiter};
use crate::timestamp::{Timestamp, TimestampError};

/// Result of [`Client::run`].
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: ClientState,
    pub session_id: u16,
    /// Always present; holds whatever was collected before a failure.
    pub report: LatencyReport,
    pub error: Option<LampError>,
}

impl SessionOutcome {
    pub fn is_done(&self) -> bool {
        self.state == ClientState::Done
    }
}

/// A configured client, ready to run one session.
pub struct Client {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    peer: SocketAddr,
    stop: StopSignal,
    diag: Arc<Diagnostics>,
}

impl Client {
    /// Validate `config` and bind a UDP socket for it.
    pub fn new(mut config: SessionConfig) -> Result<Self, LampError> {
        config.validate()?;
        if !config.role.is_client() {
            return Err(ConfigError::WrongRole("client").into());
        }
        match config.protocol {
            Protocol::Udp => {}
            Protocol::RawUdp => return Err(LampError::TransportUnavailable("raw UDP")),
            Protocol::Broker => return Err(LampError::TransportUnavailable("broker")),
        }
        let peer = config
            .peer_addr()
            .ok_or(ConfigError::MissingDestination)?;
        let local = match peer.ip() {
            IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpTransport::bind(SocketAddr::new(local, 0)).map_err(LampError::Bind)?;
        if let Some(ac) = config.access_category {
            socket
                .set_priority(ac.user_priority())
                .map_err(|source| LampError::SocketOption {
                    what: "SO_PRIORITY",
                    source,
                })?;
        }
        Self::prepared(config, Arc::new(socket), peer)
    }

    /// Run over an already-open transport (tests, external bindings).
    pub fn with_transport(
        mut config: SessionConfig,
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
    ) -> Result<Self, LampError> {
        config.validate()?;
        if !config.role.is_client() {
            return Err(ConfigError::WrongRole("client").into());
        }
        Self::prepared(config, transport, peer)
    }

    fn prepared(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
    ) -> Result<Self, LampError> {
        transport
            .enable_timestamps(config.latency_type)
            .map_err(|source| LampError::SocketOption {
                what: "timestamping",
                source,
            })?;
        Ok(Self {
            config,
            transport,
            peer,
            stop: StopSignal::new(),
            diag: Arc::new(Diagnostics::default()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Handle that ends a running session early (with partial results).
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diag)
    }

    /// Run the session. Protocol failures do not panic: the outcome carries
    /// the final state, the partial report and the error.
    ///
    /// Consumes the client; the transport is shut down when the receive
    /// thread exits.
    pub fn run(self) -> SessionOutcome {
        let session_id = loop {
            let id: u16 = rand::random();
            if id != 0 {
                break id;
            }
        };

        let mut session = Session {
            config: &self.config,
            transport: &*self.transport,
            peer: self.peer,
            session_id,
            state: ClientState::Init,
            tracker: ProbeTracker::new(1),
            followup: FollowupMode::Off,
            diag: &self.diag,
            report: LatencyReport::new(
                self.config.latency_type,
                self.config.direction(),
                FollowupMode::Off,
                self.config.confidence_mask,
            ),
        };

        let (events_tx, events) = crossbeam_channel::unbounded();
        let result = match receiver::spawn(
            Arc::clone(&self.transport),
            Some(session_id),
            events_tx,
            Arc::clone(&self.diag),
        ) {
            Ok(rx_thread) => {
                let waiter = Waiter::new(events, &self.stop);
                let result = session.drive(&waiter);
                drop(rx_thread);
                result
            }
            Err(e) => Err(e),
        };

        session.report.malformed = self.diag.malformed();
        let error = match result {
            Ok(()) => {
                session.transition(ClientState::Done);
                None
            }
            Err(LampError::Cancelled) => {
                log::info!("[lamp:tx] session {session_id} stopped");
                session.transition(ClientState::Done);
                None
            }
            Err(e) => {
                report_fatal("lamp:tx", &e);
                session.transition(ClientState::Failed);
                Some(e)
            }
        };

        SessionOutcome {
            state: session.state,
            session_id,
            report: session.report,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Session internals
// ---------------------------------------------------------------------------

struct Session<'a> {
    config: &'a SessionConfig,
    transport: &'a dyn Transport,
    peer: SocketAddr,
    session_id: u16,
    state: ClientState,
    tracker: ProbeTracker,
    followup: FollowupMode,
    diag: &'a Diagnostics,
    report: LatencyReport,
}

impl Session<'_> {
    fn transition(&mut self, next: ClientState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_move_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        log::debug!("[lamp:tx] {} -> {}", self.state, next);
        self.state = next;
    }

    fn drive(&mut self, waiter: &Waiter) -> Result<(), LampError> {
        self.handshake(waiter)?;
        match self.config.direction() {
            Direction::PingLike => self.ping_like(waiter)?,
            Direction::Unidirectional => self.unidirectional(waiter)?,
        }
        self.finish(waiter)
    }

    // ---- Handshake --------------------------------------------------------

    fn handshake(&mut self, waiter: &Waiter) -> Result<(), LampError> {
        let requested = InitParams {
            direction: self.config.direction(),
            latency_type: self.config.latency_type,
            followup: self.config.requested_followup(),
        };
        let init = Packet::new(PacketType::Init, self.session_id, 0)
            .with_payload(requested.to_payload())
            .encode()?;

        log::info!(
            "[lamp:tx] → INIT session={} to {} ({}, {})",
            self.session_id,
            self.peer,
            requested.direction,
            requested.latency_type
        );
        let (transport, peer, diag) = (self.transport, self.peer, self.diag);
        let granted = await_reply(
            waiter,
            self.config.timing.init,
            Phase::Init,
            |attempt| {
                if attempt > 1 {
                    log::debug!("[lamp:tx] → INIT (attempt {attempt})");
                }
                transport.send_to(&init, peer).map(|_| ())
            },
            |arrival| match arrival.packet.kind {
                PacketType::InitAck => Some(InitParams::from_payload(&arrival.packet.payload)),
                _ => {
                    diag.count_stale();
                    None
                }
            },
        )?
        .map_err(|e| LampError::Negotiation(e.to_string()))?;

        if granted.direction != requested.direction
            || granted.latency_type != requested.latency_type
        {
            return Err(LampError::Negotiation(format!(
                "server granted {} / {} for a {} / {} request",
                granted.direction,
                granted.latency_type,
                requested.direction,
                requested.latency_type
            )));
        }
        if requested.followup.is_active() && !granted.followup.is_active() {
            log::info!("[lamp:tx] server refused follow-up; continuing without it");
        }
        self.followup = if requested.followup.is_active() {
            granted.followup
        } else {
            FollowupMode::Off
        };
        self.report.followup = self.followup;
        log::info!("[lamp:tx] ← INIT-ACK session={}", self.session_id);
        self.transition(ClientState::Active);
        Ok(())
    }

    // ---- Ping-like --------------------------------------------------------

    fn ping_like(&mut self, waiter: &Waiter) -> Result<(), LampError> {
        let payload = pattern_payload(self.config.payload_len);
        let interval = self.config.interval();
        let mut next_tick = Instant::now();

        for _ in 0..self.config.packet_count {
            self.idle(waiter, next_tick)?;
            next_tick += interval;
            self.probe(waiter, &payload)?;
        }
        Ok(())
    }

    /// One DATA → ACK [→ FOLLOWUP → FOLLOWUP-ACK] exchange.
    fn probe(&mut self, waiter: &Waiter, payload: &[u8]) -> Result<(), LampError> {
        let seq = self.tracker.begin();
        self.report.probes_sent += 1;
        self.transition(ClientState::AwaitingReply);

        let mut packet = Packet::new(PacketType::Data, self.session_id, seq)
            .with_payload(payload.to_vec());
        let (transport, peer, diag, sid) = (self.transport, self.peer, self.diag, self.session_id);
        let latency = self.config.latency_type;
        let tracker = &mut self.tracker;

        let reply = await_reply(
            waiter,
            self.config.timing.steady,
            Phase::Ack,
            |attempt| {
                let (stamped, sent) = transport.send_stamped(&mut packet, peer)?;
                tracker.record_attempt(stamped, latency.capture_tx(stamped, sent, transport));
                log::debug!("[lamp:tx] → DATA seq={seq} attempt={attempt}");
                Ok(())
            },
            |arrival| match arrival.packet.kind {
                PacketType::Ack if arrival.packet.seq == seq => Some(arrival),
                PacketType::Followup => {
                    // Late follow-up of an earlier probe: acknowledge, ignore.
                    send_followup_ack(transport, peer, sid, arrival.packet.seq);
                    diag.count_stale();
                    None
                }
                _ => {
                    diag.count_stale();
                    None
                }
            },
        );

        let ack = match reply {
            Ok(ack) => ack,
            Err(e @ LampError::TimeoutAck) => {
                let attempts = self.tracker.abandon().map_or(0, |o| o.attempts.len());
                log::warn!("[lamp:tx] probe seq={seq} lost after {attempts} attempts: {e}");
                self.report.lost += 1;
                self.transition(ClientState::Active);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // The ACK echoes the stamp of the transmission it answers.
        let echoed = ack.packet.timestamp;
        let stamps = self
            .tracker
            .complete(seq, echoed)
            .unwrap_or(Err(TimestampError::UnmatchedEcho(echoed)))
            .and_then(|tx| latency.capture_rx(&ack.stamps).map(|rx| (tx, rx)));

        let processing = if self.followup.is_active() {
            self.transition(ClientState::FollowupPending);
            self.await_followup(waiter, seq)?
        } else {
            None
        };

        match stamps {
            Ok((tx, rx)) => {
                let latency_ms = round_trip_ms(tx, rx, processing);
                log::log!(
                    sample_log_level(self.config.verbose),
                    "[lamp:tx] ← ACK seq={seq} latency={latency_ms:.3} ms"
                );
                self.report.samples.push(Sample {
                    seq,
                    latency_ms,
                    processing_ms: processing.map(|p| p.as_millis_f64()),
                });
            }
            Err(e) => {
                log::warn!("[lamp:tx] no sample for seq={seq}: {e}");
                self.report.timestamp_errors += 1;
            }
        }
        self.transition(ClientState::Active);
        Ok(())
    }

    /// Wait for the server's processing-time estimate of `seq`.
    fn await_followup(
        &mut self,
        waiter: &Waiter,
        seq: u16,
    ) -> Result<Option<Timestamp>, LampError> {
        let (transport, peer, diag, sid) = (self.transport, self.peer, self.diag, self.session_id);
        let estimate = await_passive(waiter, self.config.timing.followup, |arrival| {
            match arrival.packet.kind {
                PacketType::Followup => {
                    send_followup_ack(transport, peer, sid, arrival.packet.seq);
                    if arrival.packet.seq == seq {
                        Some(arrival.packet.timestamp)
                    } else {
                        diag.count_stale();
                        None
                    }
                }
                _ => {
                    diag.count_stale();
                    None
                }
            }
        })?;
        match estimate {
            Some(proc_time) => {
                log::debug!("[lamp:tx] ← FOLLOWUP seq={seq} proc={proc_time}");
                Ok(Some(proc_time))
            }
            None => {
                log::warn!("[lamp:tx] no FOLLOWUP for seq={seq}; keeping the raw sample");
                self.report.followups_missing += 1;
                Ok(None)
            }
        }
    }

    // ---- Unidirectional ---------------------------------------------------

    fn unidirectional(&mut self, waiter: &Waiter) -> Result<(), LampError> {
        let payload = pattern_payload(self.config.payload_len);
        let interval = self.config.interval();
        let budget = self.config.timing.steady.max_attempts;
        let mut next_tick = Instant::now();
        let mut failures = 0u32;

        for _ in 0..self.config.packet_count {
            self.idle(waiter, next_tick)?;
            next_tick += interval;

            let seq = self.tracker.begin();
            self.report.probes_sent += 1;
            let mut packet = Packet::new(PacketType::Data, self.session_id, seq)
                .with_payload(payload.clone());
            match self.transport.send_stamped(&mut packet, self.peer) {
                Ok((at, _)) => {
                    failures = 0;
                    log::log!(
                        sample_log_level(self.config.verbose),
                        "[lamp:tx] → DATA seq={seq} at {at}"
                    );
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("[lamp:tx] DATA seq={seq} not sent: {e}");
                    if failures >= budget {
                        return Err(LampError::Send(e));
                    }
                }
            }
            self.tracker.abandon();
        }
        Ok(())
    }

    // ---- Shared -----------------------------------------------------------

    /// Drain stray arrivals until `deadline`.
    fn idle(&mut self, waiter: &Waiter, deadline: Instant) -> Result<(), LampError> {
        let (transport, peer, diag, sid) = (self.transport, self.peer, self.diag, self.session_id);
        waiter.idle_until(deadline, |arrival: Arrival| {
            if arrival.packet.kind == PacketType::Followup {
                send_followup_ack(transport, peer, sid, arrival.packet.seq);
            }
            diag.count_stale();
            false
        })?;
        Ok(())
    }

    /// Send END and collect the server's REPORT.
    fn finish(&mut self, waiter: &Waiter) -> Result<(), LampError> {
        let end = Packet::new(PacketType::End, self.session_id, self.tracker.next_seq()).encode()?;
        let (transport, peer, diag, sid) = (self.transport, self.peer, self.diag, self.session_id);
        log::debug!("[lamp:tx] → END session={sid}");

        let report = await_reply(
            waiter,
            self.config.timing.steady,
            Phase::Report,
            |_| transport.send_to(&end, peer).map(|_| ()),
            |arrival| match arrival.packet.kind {
                PacketType::Report => ServerReport::from_payload(&arrival.packet.payload).ok(),
                PacketType::Followup => {
                    send_followup_ack(transport, peer, sid, arrival.packet.seq);
                    None
                }
                _ => {
                    diag.count_stale();
                    None
                }
            },
        );

        match report {
            Ok(server) => {
                log::info!(
                    "[lamp:tx] ← REPORT: server received {} packet(s)",
                    server.received
                );
                if self.config.direction() == Direction::Unidirectional {
                    self.report.lost = self.report.probes_sent.saturating_sub(server.received);
                }
                self.report.server = Some(server);
                Ok(())
            }
            Err(e) if e.is_timeout() && self.config.direction() == Direction::PingLike => {
                log::warn!("[lamp:tx] no REPORT from the server; client-side figures only");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn send_followup_ack(transport: &dyn Transport, peer: SocketAddr, session_id: u16, seq: u16) {
    let ack = Packet::new(PacketType::FollowupAck, session_id, seq);
    match ack.encode() {
        Ok(bytes) => {
            if let Err(e) = transport.send_to(&bytes, peer) {
                log::warn!("[lamp:tx] FOLLOWUP-ACK seq={seq} not sent: {e}");
            }
        }
        Err(e) => log::warn!("[lamp:tx] FOLLOWUP-ACK seq={seq}: {e}"),
    }
}

/// Per-probe lines are part of the normal output in verbose sessions.
fn sample_log_level(verbose: bool) -> log::Level {
    if verbose {
        log::Level::Info
    } else {
        log::Level::Debug
    }
}

/// Latency of one ping-like exchange, in milliseconds.
pub fn round_trip_ms(tx: Timestamp, rx: Timestamp, processing: Option<Timestamp>) -> f64 {
    let rtt = rx.millis_since(&tx);
    processing.map_or(rtt, |p| rtt - p.as_millis_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    #[test]
    fn round_trip_subtracts_processing_time() {
        let tx = Timestamp::new(10, 0);
        let rx = Timestamp::new(10, 2_500);
        assert_eq!(round_trip_ms(tx, rx, None), 2.5);
        assert_eq!(round_trip_ms(tx, rx, Some(Timestamp::from_micros(500))), 2.0);
    }

    #[test]
    fn verbose_sessions_log_samples_at_info() {
        assert_eq!(sample_log_level(true), log::Level::Info);
        assert_eq!(sample_log_level(false), log::Level::Debug);
    }

    #[test]
    fn raw_transport_is_external() {
        let mut cfg = SessionConfig::new(Role::Client);
        cfg.direction = Some(Direction::PingLike);
        cfg.dest = Some("10.0.0.1".parse().unwrap());
        cfg.protocol = Protocol::RawUdp;
        cfg.dest_mac = Some([2, 0, 0, 0, 0, 1]);
        assert!(matches!(
            Client::new(cfg),
            Err(LampError::TransportUnavailable(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let cfg = SessionConfig::new(Role::LoopbackClient);
        assert!(matches!(Client::new(cfg), Err(LampError::Config(_))));
    }
}
