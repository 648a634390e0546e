//! The per-cell metrics row.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::RunDescriptor;
use crate::error::CellError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Degraded,
    ProvisionFailed,
    ConfigureFailed,
    MeasureFailed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Degraded => "degraded",
            Outcome::ProvisionFailed => "provision_failed",
            Outcome::ConfigureFailed => "configure_failed",
            Outcome::MeasureFailed => "measure_failed",
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, Outcome::Ok | Outcome::Degraded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dataset row. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub id: u32,
    pub algorithm: String,
    pub ip_version: String,
    pub throughput_gbps: f64,
    pub packet_loss_pct: f64,
    pub recovery_time_s: f64,
    pub rtt_mean_ms: f64,
    pub rtt_variance: f64,
    pub rtt_max_ms: f64,
    pub retransmits: u64,
    pub total_packets_sent: f64,
    pub bandwidth_efficiency_pct: f64,
    pub max_cwnd_bytes: u64,
    pub cpu_sender_pct: f64,
    pub cpu_receiver_pct: f64,
    pub cpu_local_pct: f64,
    pub probe_rtt_ms: f64,
    pub probe_loss_pct: f64,
    pub probe_jitter_ms: f64,
    pub outcome: Outcome,
    pub note: String,
}

impl MetricsRecord {
    pub const HEADER: [&'static str; 21] = [
        "id",
        "algorithm",
        "ip_version",
        "throughput_gbps",
        "packet_loss_pct",
        "recovery_time_s",
        "rtt_mean_ms",
        "rtt_variance",
        "rtt_max_ms",
        "retransmits",
        "total_packets_sent",
        "bandwidth_efficiency_pct",
        "max_cwnd_bytes",
        "cpu_sender_pct",
        "cpu_receiver_pct",
        "cpu_local_pct",
        "probe_rtt_ms",
        "probe_loss_pct",
        "probe_jitter_ms",
        "outcome",
        "note",
    ];

    /// Identifying fields from `descriptor`, zero everywhere else.
    pub fn identity(descriptor: &RunDescriptor) -> Self {
        Self {
            id: descriptor.repetition,
            algorithm: descriptor.algorithm.clone(),
            ip_version: descriptor.protocol.label().to_string(),
            throughput_gbps: 0.0,
            packet_loss_pct: 0.0,
            recovery_time_s: 0.0,
            rtt_mean_ms: 0.0,
            rtt_variance: 0.0,
            rtt_max_ms: 0.0,
            retransmits: 0,
            total_packets_sent: 0.0,
            bandwidth_efficiency_pct: 0.0,
            max_cwnd_bytes: 0,
            cpu_sender_pct: 0.0,
            cpu_receiver_pct: 0.0,
            cpu_local_pct: 0.0,
            probe_rtt_ms: 0.0,
            probe_loss_pct: 0.0,
            probe_jitter_ms: 0.0,
            outcome: Outcome::Ok,
            note: String::new(),
        }
    }

    /// Sentinel row for a cell that failed before metrics existed.
    pub fn failed(descriptor: &RunDescriptor, err: &CellError) -> Self {
        let mut notes = Notes::default();
        notes.push(format!("{}: {err}", err.kind()));
        let mut record = Self::identity(descriptor);
        notes.apply(&mut record);
        record.outcome = err.outcome();
        record
    }
}

/// Diagnostics collected while filling a record.
#[derive(Debug, Default, Clone)]
pub struct Notes(Vec<String>);

impl Notes {
    /// Add a note. Line breaks are flattened so a note stays in one cell.
    pub fn push(&mut self, note: impl Into<String>) {
        let note: String = note.into();
        let flat = note.split_whitespace().collect::<Vec<_>>().join(" ");
        if !flat.is_empty() && !self.0.contains(&flat) {
            self.0.push(flat);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write the notes into `record` and mark it degraded if there are any.
    pub fn apply(self, record: &mut MetricsRecord) {
        if self.0.is_empty() {
            record.outcome = Outcome::Ok;
            record.note.clear();
        } else {
            record.outcome = Outcome::Degraded;
            record.note = self.0.join("; ");
        }
    }
}

impl Extend<String> for Notes {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        for note in iter {
            self.push(note);
        }
    }
}
