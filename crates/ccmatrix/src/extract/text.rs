//! iperf (version 2) text report extraction.

use super::{fill_common, tool_exit_note, Extractor};
use crate::descriptor::RunDescriptor;
use crate::record::{MetricsRecord, Notes};
use crate::runner::RawCapture;
use crate::stats::{bps_to_gbps, efficiency_pct};

pub struct TextExtractor;

fn unit_scale(token: &str) -> Option<f64> {
    match token {
        "bits/sec" => Some(1.0),
        "Kbits/sec" => Some(1e3),
        "Mbits/sec" => Some(1e6),
        "Gbits/sec" => Some(1e9),
        _ => None,
    }
}

/// Throughput of the last `<decimal> <unit>bits/sec` pair in `text`, in
/// bits per second. iperf prints the whole-run summary last.
pub fn parse_throughput_bps(text: &str) -> Option<f64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens
        .windows(2)
        .filter_map(|pair| {
            let scale = unit_scale(pair[1])?;
            let value: f64 = pair[0].parse().ok()?;
            Some(value * scale)
        })
        .last()
}

impl Extractor for TextExtractor {
    fn extract(&self, descriptor: &RunDescriptor, capture: &RawCapture, capacity_bps: f64) -> MetricsRecord {
        let mut record = MetricsRecord::identity(descriptor);
        let mut notes = Notes::default();

        match &capture.traffic {
            Some(run) => match parse_throughput_bps(&run.output) {
                Some(bps) => {
                    record.throughput_gbps = bps_to_gbps(bps);
                    record.bandwidth_efficiency_pct = efficiency_pct(bps, capacity_bps);
                }
                None => notes.push("throughput not found in traffic output"),
            },
            None => notes.push("traffic output missing"),
        }
        tool_exit_note(capture, &mut notes);
        // iperf reports neither RTT nor loss; the probe stands in for both.
        fill_common(&mut record, capture, &mut notes, true);

        notes.apply(&mut record);
        record
    }
}
