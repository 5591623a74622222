//! Fault-injecting transport for deterministic testing.
//!
//! [`Simulator`] wraps any [`Transport`] and applies a configurable fault
//! model to the traffic going through it:
//!
//! | Fault            | Description                                           |
//! |------------------|-------------------------------------------------------|
//! | Random loss      | Drop an outbound datagram with probability `loss_rate`. |
//! | Typed loss (tx)  | Drop every outbound packet whose type is in `drop_outbound`. |
//! | Typed loss (rx)  | Swallow every inbound packet whose type is in `drop_inbound`. |
//! | Injection        | Deliver arbitrary bytes as if they came off the wire.  |
//!
//! Every outbound datagram, dropped or not, lands in a send log so tests can
//! count attempts. The RNG is seeded, so a failing run can be replayed.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Packet, PacketType};
use crate::socket::{Datagram, Sent, Transport};
use crate::timestamp::{LatencyType, Timestamp};

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability in `[0.0, 1.0]` that an outbound datagram is lost.
    pub loss_rate: f64,
    pub drop_outbound: Vec<PacketType>,
    pub drop_inbound: Vec<PacketType>,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            drop_outbound: Vec::new(),
            drop_inbound: Vec::new(),
            seed: 0x1a3b,
        }
    }
}

/// One outbound datagram as seen by the simulator.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// `None` when the bytes did not decode as LaMP.
    pub kind: Option<PacketType>,
    pub seq: Option<u16>,
    pub peer: SocketAddr,
    pub at: Instant,
    pub dropped: bool,
}

pub struct Simulator {
    inner: Arc<dyn Transport>,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    injected: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    log: Mutex<Vec<SentRecord>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Simulator {
    pub fn new(inner: Arc<dyn Transport>, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            injected: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Queue `bytes` for delivery as if received from `from`.
    pub fn inject(&self, bytes: Vec<u8>, from: SocketAddr) {
        lock(&self.injected).push_back((bytes, from));
    }

    pub fn sent_log(&self) -> Vec<SentRecord> {
        lock(&self.log).clone()
    }

    /// Outbound datagrams of `kind`, dropped ones included.
    pub fn sent_count(&self, kind: PacketType) -> usize {
        lock(&self.log)
            .iter()
            .filter(|r| r.kind == Some(kind))
            .count()
    }

    fn should_drop(&self, kind: Option<PacketType>) -> bool {
        if kind.is_some_and(|k| self.config.drop_outbound.contains(&k)) {
            return true;
        }
        self.config.loss_rate > 0.0 && lock(&self.rng).gen::<f64>() < self.config.loss_rate
    }
}

impl Transport for Simulator {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.send_tracked(buf, peer).map(|sent| sent.len)
    }

    fn send_tracked(&self, buf: &[u8], peer: SocketAddr) -> io::Result<Sent> {
        let decoded = Packet::decode(buf).ok();
        let kind = decoded.as_ref().map(|p| p.kind);
        let dropped = self.should_drop(kind);
        lock(&self.log).push(SentRecord {
            kind,
            seq: decoded.as_ref().map(|p| p.seq),
            peer,
            at: Instant::now(),
            dropped,
        });
        if dropped {
            log::debug!("[sim] dropped outbound {kind:?} to {peer}");
            // Never reached the kernel, so no transmit stamp either.
            return Ok(Sent {
                len: buf.len(),
                tx_key: None,
            });
        }
        self.inner.send_tracked(buf, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        loop {
            if let Some((bytes, peer)) = lock(&self.injected).pop_front() {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                return Ok(Datagram {
                    len,
                    peer,
                    kernel_rx: None,
                });
            }
            let dgram = self.inner.recv_from(buf)?;
            let kind = Packet::decode(&buf[..dgram.len]).ok().map(|p| p.kind);
            match kind {
                Some(k) if self.config.drop_inbound.contains(&k) => {
                    log::debug!("[sim] dropped inbound {k} from {}", dgram.peer);
                }
                _ => return Ok(dgram),
            }
        }
    }

    fn enable_timestamps(&self, latency: LatencyType) -> io::Result<()> {
        self.inner.enable_timestamps(latency)
    }

    fn tx_timestamp(&self, key: u32, wait: Duration) -> io::Result<Option<Timestamp>> {
        self.inner.tx_timestamp(key, wait)
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
