//! iperf3 JSON report extraction.

use serde_json::Value;
use tracing::warn;

use super::{fill_common, tool_exit_note, Extractor};
use crate::descriptor::RunDescriptor;
use crate::record::{MetricsRecord, Notes};
use crate::runner::RawCapture;
use crate::stats::{
    bps_to_gbps, efficiency_pct, population_variance, retransmit_loss_pct, round2, segments_sent,
    usec_to_ms,
};

const THROUGHPUT: &str = "end.sum_received.bits_per_second";
const RETRANSMITS: &str = "end.sum_sent.retransmits";
const BYTES_SENT: &str = "end.sum_sent.bytes";
const MSS: &str = "start.tcp_mss_default";
const MEAN_RTT: &str = "end.streams.0.sender.mean_rtt";
const MAX_RTT: &str = "end.streams.0.sender.max_rtt";
const MAX_CWND: &str = "end.streams.0.sender.max_snd_cwnd";
const CPU_SENDER: &str = "end.cpu_utilization_percent.host_total";
const CPU_RECEIVER: &str = "end.cpu_utilization_percent.remote_total";

pub struct StructuredExtractor;

/// Numeric lookups by dotted key path, collecting the paths that are absent.
struct Doc<'v> {
    root: &'v Value,
    missing: Vec<&'static str>,
}

impl<'v> Doc<'v> {
    fn num(&mut self, path: &'static str) -> f64 {
        let pointer = format!("/{}", path.replace('.', "/"));
        match self.root.pointer(&pointer).and_then(Value::as_f64) {
            Some(v) => v,
            None => {
                self.missing.push(path);
                0.0
            }
        }
    }
}

/// Per-interval RTT samples of every stream, in milliseconds.
pub fn rtt_samples(doc: &Value) -> impl Iterator<Item = f64> + '_ {
    doc.get("intervals")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|interval| interval.get("streams").and_then(Value::as_array))
        .flatten()
        .filter_map(|stream| stream.get("rtt").and_then(Value::as_f64))
        .map(usec_to_ms)
}

impl StructuredExtractor {
    fn fill(&self, root: &Value, record: &mut MetricsRecord, notes: &mut Notes, capacity_bps: f64) {
        if let Some(err) = root.get("error").and_then(Value::as_str) {
            notes.push(format!("traffic tool error: {err}"));
        }

        let mut doc = Doc {
            root,
            missing: Vec::new(),
        };
        let bps = doc.num(THROUGHPUT);
        let retransmits = doc.num(RETRANSMITS);
        let bytes = doc.num(BYTES_SENT);
        let mss = doc.num(MSS);

        record.throughput_gbps = bps_to_gbps(bps);
        record.retransmits = retransmits.max(0.0) as u64;
        record.total_packets_sent = segments_sent(bytes, mss);
        record.packet_loss_pct = retransmit_loss_pct(retransmits, record.total_packets_sent);
        record.bandwidth_efficiency_pct = efficiency_pct(bps, capacity_bps);
        record.rtt_mean_ms = round2(usec_to_ms(doc.num(MEAN_RTT)));
        record.rtt_max_ms = round2(usec_to_ms(doc.num(MAX_RTT)));
        record.max_cwnd_bytes = doc.num(MAX_CWND).max(0.0) as u64;
        record.cpu_sender_pct = round2(doc.num(CPU_SENDER));
        record.cpu_receiver_pct = round2(doc.num(CPU_RECEIVER));
        record.rtt_variance = population_variance(rtt_samples(root));

        for path in doc.missing {
            notes.push(format!("missing key {path}"));
        }
    }
}

impl Extractor for StructuredExtractor {
    fn extract(&self, descriptor: &RunDescriptor, capture: &RawCapture, capacity_bps: f64) -> MetricsRecord {
        let mut record = MetricsRecord::identity(descriptor);
        let mut notes = Notes::default();

        match &capture.traffic {
            Some(run) => match serde_json::from_str::<Value>(&run.output) {
                Ok(root) => self.fill(&root, &mut record, &mut notes, capacity_bps),
                Err(e) => {
                    warn!(cell = %descriptor, error = %e, "traffic report is not JSON");
                    notes.push(format!("traffic report is not JSON: {e}"));
                }
            },
            None => notes.push("traffic output missing"),
        }
        tool_exit_note(capture, &mut notes);
        fill_common(&mut record, capture, &mut notes, false);

        notes.apply(&mut record);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::descriptor;
    use crate::record::Outcome;
    use crate::runner::{CaptureEvidence, ToolRun};
    use std::time::Duration;

    fn report() -> Value {
        serde_json::json!({
            "start": { "tcp_mss_default": 1460 },
            "intervals": [
                { "streams": [ { "rtt": 1000 }, { "rtt": 3000 } ] },
                { "streams": [ { "rtt": 2000 } ] },
                { "streams": [ { "rtt": 4000 } ] }
            ],
            "end": {
                "sum_sent": { "retransmits": 2, "bytes": 1000000 },
                "sum_received": { "bits_per_second": 5.0e9 },
                "streams": [ { "sender": { "mean_rtt": 2500, "max_rtt": 4000, "max_snd_cwnd": 87380 } } ],
                "cpu_utilization_percent": { "host_total": 12.346, "remote_total": 3.2 }
            }
        })
    }

    fn capture_with(traffic: &str) -> RawCapture {
        RawCapture {
            traffic: Some(ToolRun {
                output: traffic.into(),
                exit_code: Some(0),
            }),
            probe: Some(ToolRun {
                output: "3 packets transmitted, 3 received, 0% packet loss, time 2003ms\n\
                         rtt min/avg/max/mdev = 200.1/200.6/201.2/0.5 ms\n"
                    .into(),
                exit_code: Some(0),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn structured_scenario() {
        let raw = capture_with(&report().to_string());
        let r = StructuredExtractor.extract(&descriptor("cubic", 1), &raw, 100e9);
        assert_eq!(r.throughput_gbps, 5.0);
        assert_eq!(r.retransmits, 2);
        assert_eq!(r.total_packets_sent, 684.93);
        assert_eq!(r.packet_loss_pct, 0.29);
        assert_eq!(r.bandwidth_efficiency_pct, 5.0);
        assert_eq!(r.rtt_mean_ms, 2.5);
        assert_eq!(r.rtt_max_ms, 4.0);
        assert_eq!(r.rtt_variance, 1.25);
        assert_eq!(r.max_cwnd_bytes, 87380);
        assert_eq!(r.cpu_sender_pct, 12.35);
        assert_eq!(r.probe_rtt_ms, 200.6);
        assert_eq!(r.probe_loss_pct, 0.0);
        assert_eq!(r.outcome, Outcome::Ok, "note: {}", r.note);
        assert!(r.note.is_empty());
    }

    #[test]
    fn missing_keys_are_noted_not_fatal() {
        let mut doc = report();
        doc["end"]["sum_sent"]
            .as_object_mut()
            .unwrap()
            .remove("bytes");
        doc.as_object_mut().unwrap().remove("intervals");
        let r = StructuredExtractor.extract(&descriptor("reno", 2), &capture_with(&doc.to_string()), 100e9);
        assert_eq!(r.total_packets_sent, 0.0);
        assert_eq!(r.packet_loss_pct, 0.0);
        assert_eq!(r.rtt_variance, 0.0);
        assert_eq!(r.throughput_gbps, 5.0);
        assert_eq!(r.outcome, Outcome::Degraded);
        assert_eq!(r.note, "missing key end.sum_sent.bytes");
    }

    #[test]
    fn tool_error_and_undecodable_output() {
        let r = StructuredExtractor.extract(
            &descriptor("bbr", 1),
            &capture_with(r#"{"start": {}, "error": "unable to send control message"}"#),
            100e9,
        );
        assert!(r.note.contains("traffic tool error: unable to send control message"));
        assert!(r.note.contains("missing key end.sum_received.bits_per_second"));

        let r = StructuredExtractor.extract(&descriptor("bbr", 1), &capture_with("iperf3: error"), 100e9);
        assert_eq!(r.throughput_gbps, 0.0);
        assert!(r.note.starts_with("traffic report is not JSON"));
        assert_eq!(r.outcome, Outcome::Degraded);
    }

    #[test]
    fn recovery_comes_from_capture_evidence() {
        let mut raw = capture_with(&report().to_string());
        raw.evidence = Some(CaptureEvidence {
            query_output: "5 0.31 ... [TCP Retransmission] ...".into(),
            window: Duration::from_millis(12_004),
        });
        let r = StructuredExtractor.extract(&descriptor("vegas", 1), &raw, 100e9);
        assert_eq!(r.recovery_time_s, 12.0);

        raw.evidence = Some(CaptureEvidence {
            query_output: String::new(),
            window: Duration::from_millis(12_004),
        });
        let r = StructuredExtractor.extract(&descriptor("vegas", 1), &raw, 100e9);
        assert_eq!(r.recovery_time_s, 0.0);
    }

    #[test]
    fn samples_are_lazy_and_in_ms() {
        let samples: Vec<f64> = rtt_samples(&report()).collect();
        assert_eq!(samples, vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(rtt_samples(&serde_json::json!({})).count(), 0);
    }
}
