//! Transmit timestamps must be paired with the send that produced them.
//!
//! [`ScriptedTransport`] stands in for the kernel: it numbers every send,
//! files a scripted transmit stamp under that number and answers like a
//! canned peer. Control packets (INIT, INIT-ACK, FOLLOWUP, FOLLOWUP-ACK,
//! END) are stamped seconds away from any DATA or ACK, so a sample paired
//! with the wrong send is off by far more than the tolerance.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use lamp::client::Client;
use lamp::config::{Direction, FollowupMode, Role, SessionConfig};
use lamp::packet::{InitParams, Packet, PacketType, ServerReport};
use lamp::server::Server;
use lamp::socket::{Datagram, Sent, Transport, RECV_POLL_INTERVAL};
use lamp::state::ClientState;
use lamp::timestamp::{LatencyType, Timestamp};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

type Inbound = (Vec<u8>, SocketAddr, Option<Timestamp>);

/// Transmit stamp the fake kernel reports for a packet.
type StampScript = fn(&Packet) -> Timestamp;
/// Datagrams the fake peer sends back, each with its kernel receive stamp.
type ReplyScript = fn(&Packet) -> Vec<(Packet, Option<Timestamp>)>;

struct ScriptedTransport {
    local: SocketAddr,
    peer: SocketAddr,
    feed: Sender<Inbound>,
    inbound: Receiver<Inbound>,
    next_key: AtomicU32,
    tx_stamps: Mutex<HashMap<u32, Timestamp>>,
    sent: Mutex<Vec<Packet>>,
    closed: AtomicBool,
    stamp: StampScript,
    reply: ReplyScript,
}

impl ScriptedTransport {
    fn new(stamp: StampScript, reply: ReplyScript) -> Arc<Self> {
        let (feed, inbound) = unbounded();
        Arc::new(Self {
            local: "127.0.0.1:40000".parse().unwrap(),
            peer: "127.0.0.1:46000".parse().unwrap(),
            feed,
            inbound,
            next_key: AtomicU32::new(0),
            tx_stamps: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stamp,
            reply,
        })
    }

    /// Queue `packet` as if it arrived from the peer.
    fn deliver(&self, packet: &Packet, kernel_rx: Option<Timestamp>) {
        self.feed
            .send((packet.encode().unwrap(), self.peer, kernel_rx))
            .unwrap();
    }

    fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_of(&self, kind: PacketType) -> Vec<Packet> {
        self.sent().into_iter().filter(|p| p.kind == kind).collect()
    }
}

impl Transport for ScriptedTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.send_tracked(buf, peer).map(|sent| sent.len)
    }

    fn send_tracked(&self, buf: &[u8], _peer: SocketAddr) -> io::Result<Sent> {
        let packet =
            Packet::decode(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.tx_stamps
            .lock()
            .unwrap()
            .insert(key, (self.stamp)(&packet));
        for (reply, kernel_rx) in (self.reply)(&packet) {
            self.deliver(&reply, kernel_rx);
        }
        self.sent.lock().unwrap().push(packet);
        Ok(Sent {
            len: buf.len(),
            tx_key: Some(key),
        })
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Datagram {
                len: 0,
                peer: self.local,
                kernel_rx: None,
            });
        }
        match self.inbound.recv_timeout(RECV_POLL_INTERVAL) {
            Ok((bytes, peer, kernel_rx)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(Datagram {
                    len: bytes.len(),
                    peer,
                    kernel_rx,
                })
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(RecvTimeoutError::Disconnected) => Ok(Datagram {
                len: 0,
                peer: self.local,
                kernel_rx: None,
            }),
        }
    }

    fn enable_timestamps(&self, _latency: LatencyType) -> io::Result<()> {
        Ok(())
    }

    fn tx_timestamp(&self, key: u32, _wait: std::time::Duration) -> io::Result<Option<Timestamp>> {
        Ok(self.tx_stamps.lock().unwrap().remove(&key))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Stamp far away from every DATA/ACK instant.
const CONTROL_STAMP: Timestamp = Timestamp { sec: 3, usec: 0 };

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// DATA `n` leaves at second 1000 + n; its ACK is stamped 10 + n ms later.
fn client_send_stamp(packet: &Packet) -> Timestamp {
    match packet.kind {
        PacketType::Data => Timestamp::new(1_000 + u64::from(packet.seq), 0),
        _ => CONTROL_STAMP,
    }
}

fn ack_arrival(seq: u16) -> Timestamp {
    Timestamp::new(1_000 + u64::from(seq), (10 + u64::from(seq)) * 1_000)
}

const PROCESSING_US: u64 = 1_000;

/// A server granting everything, answering DATA with ACK and FOLLOWUP.
fn canned_server(packet: &Packet) -> Vec<(Packet, Option<Timestamp>)> {
    let sid = packet.session_id;
    match packet.kind {
        PacketType::Init => vec![(
            Packet::new(PacketType::InitAck, sid, 0).with_payload(packet.payload.clone()),
            None,
        )],
        PacketType::Data => vec![
            (
                Packet::new(PacketType::Ack, sid, packet.seq)
                    .with_timestamp(packet.timestamp)
                    .with_payload(packet.payload.clone()),
                Some(ack_arrival(packet.seq)),
            ),
            (
                Packet::new(PacketType::Followup, sid, packet.seq)
                    .with_timestamp(Timestamp::from_micros(PROCESSING_US)),
                None,
            ),
        ],
        PacketType::End => vec![(
            Packet::new(PacketType::Report, sid, packet.seq)
                .with_payload(ServerReport::default().to_payload()),
            None,
        )],
        _ => Vec::new(),
    }
}

/// Follow-up acknowledgements between DATA packets do not shift which transmit
/// stamp each DATA sample uses.
#[test]
fn software_samples_use_their_own_data_stamp() {
    let fake = ScriptedTransport::new(client_send_stamp, canned_server);
    let mut cfg = SessionConfig::new(Role::LoopbackClient);
    cfg.direction = Some(Direction::PingLike);
    cfg.latency_type = LatencyType::Software;
    cfg.followup_requested = true;
    cfg.packet_count = 4;
    cfg.interval_ms = 10;
    let transport: Arc<dyn Transport> = fake.clone();
    let client = Client::with_transport(cfg, transport, fake.peer).expect("client");

    let outcome = client.run();

    assert!(outcome.error.is_none(), "session failed: {:?}", outcome.error);
    assert_eq!(outcome.state, ClientState::Done);
    assert_eq!(outcome.report.followup, FollowupMode::Kernel);
    assert_eq!(outcome.report.timestamp_errors, 0);
    let samples = outcome.report.samples.samples();
    assert_eq!(samples.len(), 4);
    for s in samples {
        let expected = (10 + u64::from(s.seq)) as f64 - PROCESSING_US as f64 / 1000.0;
        assert!(
            (s.latency_ms - expected).abs() < 1e-6,
            "seq {}: {} ms, expected {expected} ms",
            s.seq,
            s.latency_ms
        );
    }
    // The control sends really were interleaved with the DATA.
    assert_eq!(fake.sent_of(PacketType::FollowupAck).len(), 4);
    assert_eq!(fake.sent_of(PacketType::Init).len(), 1);
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// DATA `n` reaches the server at second 2000 + n.
fn data_arrival(seq: u16) -> Timestamp {
    Timestamp::new(2_000 + u64::from(seq), 0)
}

/// The ACK for `n` leaves 2 + n ms after DATA `n` arrived.
fn server_send_stamp(packet: &Packet) -> Timestamp {
    match packet.kind {
        PacketType::Ack => {
            let seq = u64::from(packet.seq);
            Timestamp::new(2_000 + seq, (2 + seq) * 1_000)
        }
        _ => CONTROL_STAMP,
    }
}

fn silent_client(_: &Packet) -> Vec<(Packet, Option<Timestamp>)> {
    Vec::new()
}

/// The processing estimate is taken from the ACK's own transmit stamp, not
/// from the INIT-ACK or FOLLOWUP sent before it.
#[test]
fn server_processing_time_uses_the_ack_stamp() {
    let fake = ScriptedTransport::new(server_send_stamp, silent_client);
    let sid = 7;
    let params = InitParams {
        direction: Direction::PingLike,
        latency_type: LatencyType::Software,
        followup: FollowupMode::Kernel,
    };
    fake.deliver(
        &Packet::new(PacketType::Init, sid, 0).with_payload(params.to_payload()),
        None,
    );
    for seq in 1..=3 {
        let data = Packet::new(PacketType::Data, sid, seq).with_timestamp(Timestamp::new(1, 0));
        fake.deliver(&data, Some(data_arrival(seq)));
    }
    fake.deliver(&Packet::new(PacketType::End, sid, 4), None);

    let cfg = SessionConfig::new(Role::LoopbackServer);
    let transport: Arc<dyn Transport> = fake.clone();
    let mut server = Server::with_transport(cfg, transport).expect("server");
    let served = server.serve_session().expect("session");

    assert_eq!(served.received, 3);
    // Retransmitted FOLLOWUPs carry the same estimate.
    let followups = fake.sent_of(PacketType::Followup);
    let mut seqs: Vec<u16> = followups.iter().map(|f| f.seq).collect();
    seqs.dedup();
    assert_eq!(seqs, vec![1, 2, 3]);
    for f in followups {
        assert_eq!(
            f.timestamp,
            Timestamp::from_micros((2 + u64::from(f.seq)) * 1_000),
            "FOLLOWUP seq {}",
            f.seq
        );
    }
}
