//! Turning raw tool output into a [`MetricsRecord`].
//!
//! Extraction never fails: a pattern or key that cannot be found leaves its
//! field at zero and adds a note, which marks the record degraded.

mod capture;
mod probe;
mod structured;
mod text;

pub use capture::{recovery_time_s, RETRANSMISSION_MARKER};
pub use probe::{parse_probe, ProbeSummary, RttSummary};
pub use structured::{rtt_samples, StructuredExtractor};
pub use text::{parse_throughput_bps, TextExtractor};

use crate::descriptor::{RunDescriptor, ToolMode};
use crate::record::{MetricsRecord, Notes};
use crate::runner::RawCapture;
use crate::stats::round2;

pub trait Extractor {
    fn extract(&self, descriptor: &RunDescriptor, capture: &RawCapture, capacity_bps: f64) -> MetricsRecord;
}

/// The extractor matching the tool a cell ran.
pub fn for_tool(tool: ToolMode) -> Box<dyn Extractor> {
    match tool {
        ToolMode::Iperf3Json => Box::new(StructuredExtractor),
        ToolMode::IperfText => Box::new(TextExtractor),
    }
}

/// Fields both variants fill the same way: probe, capture, local CPU.
/// With `probe_is_primary` the probe also supplies RTT and loss.
fn fill_common(record: &mut MetricsRecord, capture: &RawCapture, notes: &mut Notes, probe_is_primary: bool) {
    notes.extend(capture.notes.iter().cloned());

    match &capture.probe {
        Some(run) => {
            let summary = parse_probe(&run.output);
            match summary.rtt {
                Some(rtt) => {
                    record.probe_rtt_ms = round2(rtt.avg);
                    record.probe_jitter_ms = round2(rtt.mdev);
                    if probe_is_primary {
                        record.rtt_mean_ms = round2(rtt.avg);
                        record.rtt_max_ms = round2(rtt.max);
                    }
                }
                None => notes.push("probe rtt summary not found"),
            }
            match summary.loss_pct {
                Some(loss) => {
                    record.probe_loss_pct = round2(loss);
                    if probe_is_primary {
                        record.packet_loss_pct = round2(loss);
                    }
                }
                None => notes.push("probe packet loss not found"),
            }
        }
        None => notes.push("probe output missing"),
    }

    if let Some(evidence) = &capture.evidence {
        record.recovery_time_s = recovery_time_s(evidence);
    }
    record.cpu_local_pct = capture.local_cpu_pct.map(round2).unwrap_or(0.0);
}

fn tool_exit_note(capture: &RawCapture, notes: &mut Notes) {
    if let Some(run) = &capture.traffic {
        match run.exit_code {
            Some(0) => {}
            Some(code) => notes.push(format!("traffic tool exited with status {code}")),
            None => notes.push("traffic tool was killed by a signal"),
        }
    }
}
