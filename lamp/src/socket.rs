//! Blocking datagram transport.
//!
//! [`Transport`] is the seam between the protocol engine and whatever moves
//! bytes: a plain UDP socket ([`UdpTransport`]), the fault-injecting
//! [`crate::simulator::Simulator`] in tests, or an external raw/broker
//! binding. The engine only ever talks to `dyn Transport`.
//!
//! On Linux the UDP transport receives through `recvmsg(2)` so that kernel
//! timestamps carried as ancillary data (`SO_TIMESTAMP`, `SO_TIMESTAMPING`)
//! reach the caller next to the datagram, and it reads transmit timestamps
//! back from the socket error queue. Transmit stamps are requested with
//! `SOF_TIMESTAMPING_OPT_ID`, so each one names the send it belongs to and
//! [`Sent::tx_key`] lets the caller claim exactly that one.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::packet::Packet;
use crate::timestamp::{LatencyType, Timestamp};

/// Receive calls return at least this often so the receive thread can
/// notice a stop request.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Largest datagram the receive path accepts.
pub const MAX_DATAGRAM: usize = 2048;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// One received datagram, as seen by the receive thread.
#[derive(Debug, Clone, Copy)]
pub struct Datagram {
    pub len: usize,
    pub peer: SocketAddr,
    /// Ancillary receive timestamp, when the socket was asked for one.
    pub kernel_rx: Option<Timestamp>,
}

/// What one send handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub len: usize,
    /// Key the kernel files this datagram's transmit timestamp under
    /// (`SOF_TIMESTAMPING_OPT_ID`). `None` when no transmit stamp will come.
    pub tx_key: Option<u32>,
}

pub trait Transport: Send + Sync {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;

    /// [`Transport::send_to`], also reporting the transmit-timestamp key.
    fn send_tracked(&self, buf: &[u8], peer: SocketAddr) -> io::Result<Sent> {
        let len = self.send_to(buf, peer)?;
        Ok(Sent { len, tx_key: None })
    }

    /// Stamp `packet` with the current instant as late as possible, encode it
    /// and send it. Returns the stamp written into the packet.
    fn send_stamped(&self, packet: &mut Packet, peer: SocketAddr) -> io::Result<(Timestamp, Sent)> {
        packet.timestamp = Timestamp::now();
        let bytes = packet
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let sent = self.send_tracked(&bytes, peer)?;
        Ok((packet.timestamp, sent))
    }

    /// Block until a datagram arrives or [`RECV_POLL_INTERVAL`] elapses
    /// (`WouldBlock` / `TimedOut`). `Ok` with `len == 0` after
    /// [`Transport::shutdown`] means the transport is closed.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram>;

    /// Ask the kernel for the timestamps `latency` needs.
    fn enable_timestamps(&self, latency: LatencyType) -> io::Result<()>;

    /// Wait up to `wait` for the transmit timestamp filed under `key`.
    /// Stamps of older sends met on the way are discarded.
    fn tx_timestamp(&self, key: u32, wait: Duration) -> io::Result<Option<Timestamp>>;

    /// Wake a thread blocked in [`Transport::recv_from`] and stop receiving.
    fn shutdown(&self);

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Re-run `f` for as long as it fails with `EINTR`.
pub fn retry_eintr<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// `true` for the errors a read timeout produces.
pub fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

const STAMP_NONE: u8 = 0;
const STAMP_KRT: u8 = 1;
const STAMP_SOFTWARE: u8 = 2;
const STAMP_HARDWARE: u8 = 3;

/// UDP transport over a blocking std socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    stamping: AtomicU8,
    /// Key the kernel will give the next transmit timestamp.
    next_tx_key: AtomicU32,
    /// Transmit stamps read off the error queue ahead of their claim.
    unclaimed: Mutex<VecDeque<(u32, Timestamp)>>,
}

impl UdpTransport {
    /// Bind a new socket to `addr`. Port 0 lets the OS choose.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        Ok(Self {
            socket,
            stamping: AtomicU8::new(STAMP_NONE),
            next_tx_key: AtomicU32::new(0),
            unclaimed: Mutex::new(VecDeque::new()),
        })
    }

    /// Set `SO_PRIORITY` (access category user priority).
    #[cfg(target_os = "linux")]
    pub fn set_priority(&self, priority: i32) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        sys::set_int_opt(
            self.socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            priority,
        )
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_priority(&self, _priority: i32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_PRIORITY is Linux-only",
        ))
    }

    #[cfg(target_os = "linux")]
    fn unclaimed(&self) -> MutexGuard<'_, VecDeque<(u32, Timestamp)>> {
        self.unclaimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wrapping order of two transmit keys: `true` if `a` was issued before `b`.
#[cfg(target_os = "linux")]
fn key_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(target_os = "linux")]
impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.send_tracked(buf, peer).map(|sent| sent.len)
    }

    fn send_tracked(&self, buf: &[u8], peer: SocketAddr) -> io::Result<Sent> {
        let len = retry_eintr(|| self.socket.send_to(buf, peer))?;
        // With OPT_ID the kernel numbers every stamped send from zero.
        let tx_key = (self.stamping.load(Ordering::Relaxed) >= STAMP_SOFTWARE)
            .then(|| self.next_tx_key.fetch_add(1, Ordering::Relaxed));
        Ok(Sent { len, tx_key })
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        use std::os::unix::io::AsRawFd;
        let mode = self.stamping.load(Ordering::Relaxed);
        let got = sys::recv_msg(self.socket.as_raw_fd(), buf, 0, mode)?;
        let peer = match got.peer {
            Some(peer) => peer,
            // Only a shut-down socket returns without an address.
            None => self.socket.local_addr()?,
        };
        Ok(Datagram {
            len: got.len,
            peer,
            kernel_rx: got.stamp,
        })
    }

    fn enable_timestamps(&self, latency: LatencyType) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.socket.as_raw_fd();
        let previous = self.stamping.load(Ordering::Relaxed);
        let mode = match latency {
            LatencyType::UserToUser | LatencyType::Krt => {
                if previous >= STAMP_SOFTWARE {
                    sys::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, 0)?;
                }
                let krt = latency == LatencyType::Krt;
                if krt || previous == STAMP_KRT {
                    sys::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, i32::from(krt))?;
                }
                if krt {
                    STAMP_KRT
                } else {
                    STAMP_NONE
                }
            }
            LatencyType::Software | LatencyType::Hardware => {
                let (flags, mode) = if latency == LatencyType::Software {
                    (sys::SOFTWARE_FLAGS, STAMP_SOFTWARE)
                } else {
                    (sys::HARDWARE_FLAGS, STAMP_HARDWARE)
                };
                sys::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags)?;
                // The kernel restarts its key counter only when OPT_ID goes on.
                if previous < STAMP_SOFTWARE {
                    self.next_tx_key.store(0, Ordering::Relaxed);
                    self.unclaimed().clear();
                }
                mode
            }
        };
        self.stamping.store(mode, Ordering::Relaxed);
        log::debug!("[socket] timestamping set for {latency}");
        Ok(())
    }

    fn tx_timestamp(&self, key: u32, wait: Duration) -> io::Result<Option<Timestamp>> {
        use std::os::unix::io::AsRawFd;
        let mode = self.stamping.load(Ordering::Relaxed);
        if mode < STAMP_SOFTWARE {
            return Ok(None);
        }
        {
            let mut unclaimed = self.unclaimed();
            unclaimed.retain(|(k, _)| !key_before(*k, key));
            if let Some(pos) = unclaimed.iter().position(|(k, _)| *k == key) {
                return Ok(unclaimed.remove(pos).map(|(_, stamp)| stamp));
            }
        }

        let deadline = std::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let Some((found, stamp)) = sys::read_errqueue(self.socket.as_raw_fd(), remaining, mode)?
            else {
                return Ok(None);
            };
            if found == key {
                return Ok(Some(stamp));
            }
            if key_before(found, key) {
                log::trace!("[socket] dropping transmit stamp #{found} while waiting for #{key}");
            } else {
                self.unclaimed().push_back((found, stamp));
            }
        }
    }

    fn shutdown(&self) {
        use std::os::unix::io::AsRawFd;
        // An unconnected UDP socket reports ENOTCONN but still wakes readers.
        unsafe {
            libc::shutdown(self.socket.as_raw_fd(), libc::SHUT_RD);
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        retry_eintr(|| self.socket.send_to(buf, peer))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        let (len, peer) = retry_eintr(|| self.socket.recv_from(buf))?;
        Ok(Datagram {
            len,
            peer,
            kernel_rx: None,
        })
    }

    fn enable_timestamps(&self, latency: LatencyType) -> io::Result<()> {
        if latency.needs_kernel_rx() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel timestamps are Linux-only",
            ));
        }
        Ok(())
    }

    fn tx_timestamp(&self, _key: u32, _wait: Duration) -> io::Result<Option<Timestamp>> {
        Ok(None)
    }

    fn shutdown(&self) {}

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ---------------------------------------------------------------------------
// Linux ancillary-data plumbing
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::RawFd;
    use std::time::{Duration, Instant};

    use super::{retry_eintr, STAMP_HARDWARE, STAMP_KRT, STAMP_SOFTWARE};
    use crate::timestamp::Timestamp;

    // linux/net_tstamp.h
    const SOF_TIMESTAMPING_TX_HARDWARE: i32 = 1 << 0;
    const SOF_TIMESTAMPING_TX_SOFTWARE: i32 = 1 << 1;
    const SOF_TIMESTAMPING_RX_HARDWARE: i32 = 1 << 2;
    const SOF_TIMESTAMPING_RX_SOFTWARE: i32 = 1 << 3;
    const SOF_TIMESTAMPING_SOFTWARE: i32 = 1 << 4;
    const SOF_TIMESTAMPING_RAW_HARDWARE: i32 = 1 << 6;
    const SOF_TIMESTAMPING_OPT_ID: i32 = 1 << 7;
    const SOF_TIMESTAMPING_OPT_TSONLY: i32 = 1 << 11;

    // linux/errqueue.h
    const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

    pub(super) const SOFTWARE_FLAGS: i32 = SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_OPT_ID
        | SOF_TIMESTAMPING_OPT_TSONLY;

    pub(super) const HARDWARE_FLAGS: i32 = SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE
        | SOF_TIMESTAMPING_OPT_ID
        | SOF_TIMESTAMPING_OPT_TSONLY;

    /// Room for a few control messages; u64 keeps `cmsghdr` alignment.
    const CONTROL_WORDS: usize = 64;

    pub(super) fn set_int_opt(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
        let value: libc::c_int = value;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One `recvmsg(2)` result with the ancillary data we care about.
    pub(super) struct Received {
        pub len: usize,
        pub peer: Option<SocketAddr>,
        /// Timestamp selected by the stamping mode.
        pub stamp: Option<Timestamp>,
        /// `ee_data` of a timestamping error-queue message.
        pub tx_key: Option<u32>,
    }

    pub(super) fn recv_msg(
        fd: RawFd,
        buf: &mut [u8],
        flags: i32,
        mode: u8,
    ) -> io::Result<Received> {
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut control = [0u64; CONTROL_WORDS];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = (&mut addr as *mut libc::sockaddr_storage).cast();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let len = retry_eintr(|| {
            let n = unsafe { libc::recvmsg(fd, &mut msg, flags) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })?;

        let peer = if msg.msg_namelen > 0 {
            sockaddr_to_std(&addr)
        } else {
            None
        };
        let (stamp, tx_key) = unsafe { parse_control(&msg, mode) };
        Ok(Received {
            len,
            peer,
            stamp,
            tx_key,
        })
    }

    /// Wait up to `wait` for the next transmit timestamp on the error queue.
    /// Returns it with the key of the send it belongs to.
    pub(super) fn read_errqueue(
        fd: RawFd,
        wait: Duration,
        mode: u8,
    ) -> io::Result<Option<(u32, Timestamp)>> {
        let deadline = Instant::now() + wait;
        let mut scratch = [0u8; 64];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLERR,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                return Ok(None);
            }
            match recv_msg(fd, &mut scratch, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT, mode) {
                Ok(Received {
                    stamp: Some(stamp),
                    tx_key: Some(key),
                    ..
                }) => return Ok(Some((key, stamp))),
                // Not a timestamp (e.g. an ICMP error); keep waiting.
                Ok(_) => continue,
                Err(e) if super::is_poll_timeout(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    unsafe fn parse_control(msg: &libc::msghdr, mode: u8) -> (Option<Timestamp>, Option<u32>) {
        let mut found = None;
        let mut tx_key = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let data = libc::CMSG_DATA(cmsg);
            if hdr.cmsg_level == libc::SOL_SOCKET {
                if hdr.cmsg_type == libc::SO_TIMESTAMP && mode == STAMP_KRT {
                    let tv: libc::timeval = std::ptr::read_unaligned(data.cast());
                    found = Some(Timestamp::new(tv.tv_sec as u64, tv.tv_usec as u64));
                } else if hdr.cmsg_type == libc::SO_TIMESTAMPING {
                    let ts: [libc::timespec; 3] = std::ptr::read_unaligned(data.cast());
                    let pick = match mode {
                        STAMP_SOFTWARE => ts[0],
                        STAMP_HARDWARE => ts[2],
                        _ => ts[0],
                    };
                    if pick.tv_sec != 0 || pick.tv_nsec != 0 {
                        found = Some(Timestamp::new(
                            pick.tv_sec as u64,
                            pick.tv_nsec as u64 / 1000,
                        ));
                    }
                }
            } else if (hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR)
                || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR)
            {
                let ee: libc::sock_extended_err = std::ptr::read_unaligned(data.cast());
                if ee.ee_origin == SO_EE_ORIGIN_TIMESTAMPING {
                    tx_key = Some(ee.ee_data);
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
        (found, tx_key)
    }

    fn sockaddr_to_std(addr: &libc::sockaddr_storage) -> Option<SocketAddr> {
        match addr.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn loopback() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap()).expect("bind")
    }

    #[test]
    fn retry_eintr_retries_interrupted_calls() {
        let mut calls = 0;
        let out = retry_eintr(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn retry_eintr_passes_other_errors_through() {
        let out: io::Result<()> = retry_eintr(|| Err(io::Error::from(io::ErrorKind::NotFound)));
        assert_eq!(out.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn send_stamped_delivers_a_stamped_packet() {
        let a = loopback();
        let b = loopback();
        let mut pkt = Packet::new(PacketType::Data, 5, 1);
        let (stamp, sent) = a.send_stamped(&mut pkt, b.local_addr().unwrap()).unwrap();
        assert!(!stamp.is_zero());
        // No transmit timestamps were requested.
        assert_eq!(sent.tx_key, None);

        let mut buf = [0u8; MAX_DATAGRAM];
        let dgram = b.recv_from(&mut buf).unwrap();
        assert_eq!(dgram.peer, a.local_addr().unwrap());
        let got = Packet::decode(&buf[..dgram.len]).unwrap();
        assert_eq!(got.timestamp, stamp);
        assert_eq!(got.seq, 1);
    }

    #[test]
    fn recv_times_out_without_traffic() {
        let a = loopback();
        let mut buf = [0u8; 64];
        let err = a.recv_from(&mut buf).unwrap_err();
        assert!(is_poll_timeout(&err), "got {err:?}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn krt_delivers_kernel_receive_stamp() {
        let a = loopback();
        let b = loopback();
        b.enable_timestamps(LatencyType::Krt).unwrap();
        a.send_to(&[1, 2, 3], b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let dgram = b.recv_from(&mut buf).unwrap();
        assert_eq!(dgram.len, 3);
        let stamp = dgram.kernel_rx.expect("kernel stamp");
        assert!(stamp.sec > 1_577_836_800);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn transmit_keys_order_across_wraparound() {
        assert!(key_before(1, 2));
        assert!(!key_before(2, 2));
        assert!(!key_before(3, 2));
        assert!(key_before(u32::MAX, 0));
    }

    /// Each send claims its own errqueue stamp, not the oldest one queued.
    #[cfg(target_os = "linux")]
    #[test]
    fn software_tx_stamp_belongs_to_its_send() {
        let a = loopback();
        let b = loopback();
        a.enable_timestamps(LatencyType::Software).unwrap();
        let dest = b.local_addr().unwrap();

        let first = a.send_tracked(&[1], dest).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let before_second = Timestamp::now();
        let second = a.send_tracked(&[2], dest).unwrap();
        assert_eq!(first.tx_key, Some(0));
        assert_eq!(second.tx_key, Some(1));

        let stamp = a
            .tx_timestamp(1, Duration::from_millis(500))
            .unwrap()
            .expect("transmit stamp of the second send");
        assert!(stamp >= before_second, "{stamp} predates the second send");
        // The first send's stamp was passed over on the way.
        assert_eq!(a.tx_timestamp(0, Duration::from_millis(20)).unwrap(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn queued_tx_stamps_are_claimed_in_send_order() {
        let a = loopback();
        let b = loopback();
        a.enable_timestamps(LatencyType::Software).unwrap();
        let dest = b.local_addr().unwrap();

        let before_first = Timestamp::now();
        let k0 = a.send_tracked(&[1], dest).unwrap().tx_key.unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let before_second = Timestamp::now();
        let k1 = a.send_tracked(&[2], dest).unwrap().tx_key.unwrap();

        let wait = Duration::from_millis(500);
        let first = a.tx_timestamp(k0, wait).unwrap().expect("first");
        let second = a.tx_timestamp(k1, wait).unwrap().expect("second");
        assert!(first >= before_first && first < before_second);
        assert!(second >= before_second);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn leaving_software_mode_stops_transmit_keys() {
        let a = loopback();
        let b = loopback();
        a.enable_timestamps(LatencyType::Software).unwrap();
        a.enable_timestamps(LatencyType::Krt).unwrap();
        let sent = a.send_tracked(&[1], b.local_addr().unwrap()).unwrap();
        assert_eq!(sent.tx_key, None);
    }
}
