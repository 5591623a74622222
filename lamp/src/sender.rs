//! Outbound probe bookkeeping for the client.
//!
//! [`ProbeTracker`] owns sequence numbering and the single outstanding probe.
//! It does **not** touch the socket; the client session calls these methods
//! around its own sends.
//!
//! # Contract
//! - Sequence numbers go up by exactly one per new probe (wrapping at 2^16).
//! - At most **one** probe is outstanding.
//! - A reply matches only if its sequence number equals the outstanding one.
//! - Retransmissions reuse the sequence number. Each one keeps its own send
//!   instants, and a reply is timed from the transmission whose stamp it
//!   echoes.

use crate::timestamp::{Timestamp, TimestampError};

/// One transmission of the outstanding probe.
#[derive(Debug)]
pub struct Attempt {
    /// User-space instant written into the packet; the ACK echoes it.
    pub stamped: Timestamp,
    /// Send instant for the session's latency type.
    pub tx: Result<Timestamp, TimestampError>,
}

/// The probe currently waiting for its reply.
#[derive(Debug)]
pub struct Outstanding {
    pub seq: u16,
    /// In send order; the first entry is the original transmission.
    pub attempts: Vec<Attempt>,
}

#[derive(Debug)]
pub struct ProbeTracker {
    next_seq: u16,
    outstanding: Option<Outstanding>,
}

impl ProbeTracker {
    /// `first_seq` is the number the first DATA probe carries.
    pub fn new(first_seq: u16) -> Self {
        Self {
            next_seq: first_seq,
            outstanding: None,
        }
    }

    /// Reserve the next sequence number and mark it outstanding.
    pub fn begin(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some(Outstanding {
            seq,
            attempts: Vec::new(),
        });
        seq
    }

    /// Record a (re)transmission of the outstanding probe.
    pub fn record_attempt(&mut self, stamped: Timestamp, tx: Result<Timestamp, TimestampError>) {
        if let Some(o) = self.outstanding.as_mut() {
            o.attempts.push(Attempt { stamped, tx });
        }
    }

    fn matches(&self, seq: u16) -> bool {
        self.outstanding.as_ref().is_some_and(|o| o.seq == seq)
    }

    /// Close the outstanding probe with a reply for `seq` that echoes the
    /// send stamp `echoed`, and return the send instant of the attempt it
    /// answers. `None` if `seq` is not outstanding.
    pub fn complete(
        &mut self,
        seq: u16,
        echoed: Timestamp,
    ) -> Option<Result<Timestamp, TimestampError>> {
        if !self.matches(seq) {
            return None;
        }
        let o = self.outstanding.take()?;
        let answered = o
            .attempts
            .into_iter()
            .find(|a| a.stamped == echoed)
            .map_or(Err(TimestampError::UnmatchedEcho(echoed)), |a| a.tx);
        Some(answered)
    }

    /// Give up on the outstanding probe.
    pub fn abandon(&mut self) -> Option<Outstanding> {
        self.outstanding.take()
    }

    /// Sequence number the next [`begin`](Self::begin) will hand out.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_by_one() {
        let mut t = ProbeTracker::new(1);
        let seqs: Vec<u16> = (0..5)
            .map(|_| {
                let s = t.begin();
                t.abandon();
                s
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(t.next_seq(), 6);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut t = ProbeTracker::new(u16::MAX);
        assert_eq!(t.begin(), u16::MAX);
        assert_eq!(t.begin(), 0);
    }

    #[test]
    fn only_the_outstanding_seq_completes() {
        let mut t = ProbeTracker::new(10);
        let s = t.begin();
        let at = Timestamp::new(1, 0);
        t.record_attempt(at, Ok(at));
        assert!(t.complete(s - 1, at).is_none());
        assert!(t.complete(s + 1, at).is_none());
        assert_eq!(t.complete(s, at).unwrap().unwrap(), at);
        // Duplicate reply after completion is no longer accepted.
        assert!(t.complete(s, at).is_none());
    }

    /// A late reply to the first transmission is timed from that
    /// transmission, not from the retry sent after it.
    #[test]
    fn reply_is_timed_from_the_attempt_it_echoes() {
        let mut t = ProbeTracker::new(1);
        let s = t.begin();
        let first = Timestamp::new(100, 0);
        let retry = Timestamp::new(100, 200_000);
        t.record_attempt(first, Ok(Timestamp::new(100, 50)));
        t.record_attempt(retry, Ok(Timestamp::new(100, 200_050)));

        let tx = t.complete(s, first).unwrap().unwrap();
        assert_eq!(tx, Timestamp::new(100, 50));
    }

    #[test]
    fn failed_capture_stays_with_its_attempt() {
        let mut t = ProbeTracker::new(1);
        let s = t.begin();
        let first = Timestamp::new(5, 0);
        let retry = Timestamp::new(5, 200_000);
        t.record_attempt(first, Err(TimestampError::ErrqueueTimeout(Default::default())));
        t.record_attempt(retry, Ok(retry));

        assert_eq!(t.complete(s, retry).unwrap().unwrap(), retry);
    }

    #[test]
    fn unknown_echo_is_a_timestamp_error() {
        let mut t = ProbeTracker::new(1);
        let s = t.begin();
        t.record_attempt(Timestamp::new(1, 0), Ok(Timestamp::new(1, 0)));
        let bogus = Timestamp::new(9, 9);
        assert!(matches!(
            t.complete(s, bogus),
            Some(Err(TimestampError::UnmatchedEcho(e))) if e == bogus
        ));
    }

    #[test]
    fn record_without_probe_is_ignored() {
        let mut t = ProbeTracker::new(1);
        t.record_attempt(Timestamp::new(1, 0), Ok(Timestamp::new(1, 0)));
        assert!(t.abandon().is_none());
    }

    #[test]
    fn abandon_returns_every_attempt() {
        let mut t = ProbeTracker::new(3);
        t.begin();
        for i in 0..3 {
            let at = Timestamp::new(i, 0);
            t.record_attempt(at, Ok(at));
        }
        let o = t.abandon().unwrap();
        assert_eq!(o.seq, 3);
        assert_eq!(o.attempts.len(), 3);
    }
}
