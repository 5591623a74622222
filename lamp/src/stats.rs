//! Latency samples, aggregate statistics and the end-of-session report.

use std::fmt;

use crate::config::{ConfidenceMask, Direction, FollowupMode};
use crate::packet::ServerReport;
use crate::timestamp::LatencyType;

/// Running count, min, max, mean and sample variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    m2: f64,
}

impl Statistics {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample variance (n − 1); zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// `mean ± z·s/√n` for `level`; `None` below two samples.
    pub fn confidence_interval(&self, level: ConfidenceLevel) -> Option<(f64, f64)> {
        if self.count < 2 {
            return None;
        }
        let half = level.z() * self.std_dev() / (self.count as f64).sqrt();
        Some((self.mean - half, self.mean + half))
    }

    /// REPORT payload for a server that saw `received` DATA packets.
    pub fn to_server_report(&self, received: u64, out_of_order: u64) -> ServerReport {
        ServerReport {
            received,
            out_of_order,
            min_ms: self.min,
            max_ms: self.max,
            mean_ms: self.mean,
            variance: self.variance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    P90,
    P95,
    P99,
}

impl ConfidenceLevel {
    pub fn z(self) -> f64 {
        match self {
            ConfidenceLevel::P90 => 1.645,
            ConfidenceLevel::P95 => 1.960,
            ConfidenceLevel::P99 => 2.576,
        }
    }

    /// Levels selected by `mask`, lowest first.
    pub fn selected(mask: ConfidenceMask) -> Vec<ConfidenceLevel> {
        [
            (ConfidenceMask::P90, ConfidenceLevel::P90),
            (ConfidenceMask::P95, ConfidenceLevel::P95),
            (ConfidenceMask::P99, ConfidenceLevel::P99),
        ]
        .into_iter()
        .filter(|(bit, _)| mask.contains(*bit))
        .map(|(_, level)| level)
        .collect()
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::P90 => f.write_str(".90"),
            ConfidenceLevel::P95 => f.write_str(".95"),
            ConfidenceLevel::P99 => f.write_str(".99"),
        }
    }
}

/// One latency value, tagged with its probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub seq: u16,
    pub latency_ms: f64,
    /// Server processing time subtracted from the round trip, if any.
    pub processing_ms: Option<f64>,
}

/// Ordered samples plus their running aggregates.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: Vec<Sample>,
    stats: Statistics,
}

impl SampleSet {
    pub fn push(&mut self, sample: Sample) {
        self.stats.push(sample.latency_ms);
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }
}

/// Everything a finished (or aborted) client session hands to the report
/// writer.
#[derive(Debug, Clone)]
pub struct LatencyReport {
    pub latency_type: LatencyType,
    pub direction: Direction,
    pub followup: FollowupMode,
    pub samples: SampleSet,
    /// Probes sent (first transmissions only).
    pub probes_sent: u64,
    /// Probes that never got a reply.
    pub lost: u64,
    pub timestamp_errors: u64,
    pub followups_missing: u64,
    pub malformed: u64,
    pub confidence_mask: ConfidenceMask,
    /// Statistics computed by the server, if its REPORT arrived.
    pub server: Option<ServerReport>,
}

impl LatencyReport {
    pub fn new(
        latency_type: LatencyType,
        direction: Direction,
        followup: FollowupMode,
        confidence_mask: ConfidenceMask,
    ) -> Self {
        Self {
            latency_type,
            direction,
            followup,
            samples: SampleSet::default(),
            probes_sent: 0,
            lost: 0,
            timestamp_errors: 0,
            followups_missing: 0,
            malformed: 0,
            confidence_mask,
            server: None,
        }
    }

    /// Aggregates for display: the client's own samples, or the server's
    /// one-way figures in unidirectional mode.
    fn headline(&self) -> Option<(u64, f64, f64, f64, f64)> {
        let s = self.samples.stats();
        if s.count > 0 {
            return Some((s.count, s.min, s.max, s.mean, s.variance()));
        }
        self.server
            .filter(|r| r.received > 0)
            .map(|r| (r.received, r.min_ms, r.max_ms, r.mean_ms, r.variance))
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Latency type: {} ({}){}",
            self.latency_type,
            self.direction,
            if self.followup.is_active() {
                ", follow-up"
            } else {
                ""
            }
        )?;
        writeln!(
            f,
            "Probes: {} sent, {} lost, {} timestamp errors, {} follow-ups missing",
            self.probes_sent, self.lost, self.timestamp_errors, self.followups_missing
        )?;
        let Some((count, min, max, mean, variance)) = self.headline() else {
            return writeln!(f, "No latency samples collected.");
        };
        writeln!(
            f,
            "Samples: {count}  min: {min:.3} ms  max: {max:.3} ms  mean: {mean:.3} ms  variance: {variance:.3} ms^2"
        )?;
        let stats = self.samples.stats();
        if stats.count > 0 {
            for level in ConfidenceLevel::selected(self.confidence_mask) {
                if let Some((lo, hi)) = stats.confidence_interval(level) {
                    writeln!(f, "Confidence interval {level}: [{lo:.3}, {hi:.3}] ms")?;
                }
            }
        }
        if let Some(server) = &self.server {
            writeln!(
                f,
                "Server: {} received, {} out of order",
                server.received, server.out_of_order
            )?;
        }
        Ok(())
    }
}
