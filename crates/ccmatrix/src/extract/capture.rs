use crate::runner::CaptureEvidence;
use crate::stats::round2;

/// Matched case-insensitively against the capture query output.
pub const RETRANSMISSION_MARKER: &str = "retransmission";

/// Upper bound on loss recovery: the whole detection window when the
/// capture shows a retransmission, 0 otherwise.
pub fn recovery_time_s(evidence: &CaptureEvidence) -> f64 {
    if evidence
        .query_output
        .to_ascii_lowercase()
        .contains(RETRANSMISSION_MARKER)
    {
        round2(evidence.window.as_secs_f64())
    } else {
        0.0
    }
}
