//! Receive-side thread of a session.
//!
//! The thread blocks in [`Transport::recv_from`], stamps every datagram the
//! moment the call returns, decodes it and forwards it to the session thread
//! over a channel. It never touches session state: anything that is not a
//! well-formed LaMP packet for the right session is counted in
//! [`Diagnostics`] and dropped here.
//!
//! Teardown: dropping the [`ReceiverHandle`] raises the stop flag, shuts the
//! transport down to unblock the receive call and joins the thread.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use crate::error::LampError;
use crate::packet::Packet;
use crate::socket::{is_poll_timeout, Transport, MAX_DATAGRAM};
use crate::timestamp::{RxStamps, Timestamp};

/// A decoded packet plus where and when it arrived.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub packet: Packet,
    pub peer: SocketAddr,
    pub stamps: RxStamps,
}

/// Message from the receive thread to the session thread.
#[derive(Debug)]
pub enum Inbound {
    Packet(Arrival),
    /// The receive call failed for a reason other than a poll timeout.
    Failed(io::Error),
}

/// Counters for everything the session ignores.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Datagrams that failed to decode.
    pub malformed: AtomicU64,
    /// Packets from another session or peer.
    pub foreign: AtomicU64,
    /// Well-formed packets of the right session nobody was waiting for.
    pub stale: AtomicU64,
}

impl Diagnostics {
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn foreign(&self) -> u64 {
        self.foreign.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn count_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_foreign(&self) {
        self.foreign.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owner of a running receive thread.
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    thread: Option<JoinHandle<()>>,
}

/// Start the receive thread.
///
/// With `session` set, packets carrying another session id are counted as
/// foreign and not forwarded.
pub fn spawn(
    transport: Arc<dyn Transport>,
    session: Option<u16>,
    events: Sender<Inbound>,
    diag: Arc<Diagnostics>,
) -> Result<ReceiverHandle, LampError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let stop = Arc::clone(&stop);
        let transport = Arc::clone(&transport);
        thread::Builder::new()
            .name("lamp-rx".into())
            .spawn(move || receive_loop(&*transport, session, &events, &diag, &stop))
            .map_err(|source| LampError::ThreadSpawn {
                name: "lamp-rx",
                source,
            })?
    };
    Ok(ReceiverHandle {
        stop,
        transport,
        thread: Some(thread),
    })
}

fn receive_loop(
    transport: &dyn Transport,
    session: Option<u16>,
    events: &Sender<Inbound>,
    diag: &Diagnostics,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !stop.load(Ordering::SeqCst) {
        let dgram = match transport.recv_from(&mut buf) {
            Ok(d) => d,
            Err(e) if is_poll_timeout(&e) => continue,
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("[lamp:rx] receive failed: {e}");
                let _ = events.send(Inbound::Failed(e));
                break;
            }
        };
        let user = Timestamp::now();
        if dgram.len == 0 && stop.load(Ordering::SeqCst) {
            break;
        }

        let packet = match Packet::decode(&buf[..dgram.len]) {
            Ok(p) => p,
            Err(e) => {
                diag.malformed.fetch_add(1, Ordering::Relaxed);
                log::debug!("[lamp:rx] dropped {} bytes from {}: {e}", dgram.len, dgram.peer);
                continue;
            }
        };
        if session.is_some_and(|id| id != packet.session_id) {
            diag.count_foreign();
            log::debug!(
                "[lamp:rx] dropped {} for session {} from {}",
                packet.kind,
                packet.session_id,
                dgram.peer
            );
            continue;
        }

        log::debug!("[lamp:rx] ← {} seq={} from {}", packet.kind, packet.seq, dgram.peer);
        let arrival = Arrival {
            packet,
            peer: dgram.peer,
            stamps: RxStamps {
                user,
                kernel: dgram.kernel_rx,
            },
        };
        if events.send(Inbound::Packet(arrival)).is_err() {
            // Session thread is gone.
            break;
        }
    }
}

impl ReceiverHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.transport.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[lamp:rx] receive thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use crate::socket::UdpTransport;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn pair() -> (Arc<dyn Transport>, UdpTransport) {
        let rx: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        let tx = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        (rx, tx)
    }

    #[test]
    fn forwards_packets_and_counts_garbage() {
        let (rx, tx) = pair();
        let dest = rx.local_addr().unwrap();
        let (events_tx, events) = unbounded();
        let diag = Arc::new(Diagnostics::default());
        let handle = spawn(Arc::clone(&rx), Some(9), events_tx, Arc::clone(&diag)).unwrap();

        tx.send_to(b"garbage", dest).unwrap();
        let other = Packet::new(PacketType::Ack, 8, 1).encode().unwrap();
        tx.send_to(&other, dest).unwrap();
        let ours = Packet::new(PacketType::Ack, 9, 1).encode().unwrap();
        tx.send_to(&ours, dest).unwrap();

        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            Inbound::Packet(a) => {
                assert_eq!(a.packet.session_id, 9);
                assert_eq!(a.peer, tx.local_addr().unwrap());
                assert!(!a.stamps.user.is_zero());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(diag.malformed(), 1);
        assert_eq!(diag.foreign(), 1);
        drop(handle);
    }

    #[test]
    fn drop_joins_an_idle_thread() {
        let (rx, _tx) = pair();
        let (events_tx, _events) = unbounded();
        let handle = spawn(rx, None, events_tx, Arc::default()).unwrap();
        assert!(handle.is_running());
        let start = std::time::Instant::now();
        drop(handle);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
