//! Derived statistics with fixed numeric semantics.
//!
//! Every value that lands in a record is rounded to a fixed number of
//! decimals, so a record read back from disk compares equal to the one
//! written. Throughput keeps six decimals of Gbps (1 kbit/s), everything else
//! two.

/// Decimals kept for `throughput_gbps`.
pub const THROUGHPUT_DECIMALS: i32 = 6;

/// Round half away from zero to `decimals` places. Non-finite input is 0.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Round half away from zero to two decimals.
pub fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

/// Population variance (divide by N) in one pass, rounded to two decimals.
///
/// Uses Welford's update so the samples can come from a lazy iterator.
/// An empty input has variance 0.
pub fn population_variance<I>(samples: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0u64;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for x in samples {
        count += 1;
        let delta = x - mean;
        mean += delta / count as f64;
        m2 += delta * (x - mean);
    }
    if count == 0 {
        return 0.0;
    }
    round2(m2 / count as f64)
}

/// Segments sent, `bytes / mss`, rounded. Zero when the MSS is unknown.
pub fn segments_sent(bytes: f64, mss: f64) -> f64 {
    if mss <= 0.0 {
        return 0.0;
    }
    round2(bytes / mss)
}

/// Retransmitted share of the (already rounded) segment count, in percent.
pub fn retransmit_loss_pct(retransmits: f64, segments: f64) -> f64 {
    if segments <= 0.0 {
        return 0.0;
    }
    round2(retransmits / segments * 100.0)
}

/// Throughput as a share of the configured link capacity, in percent.
pub fn efficiency_pct(throughput_bps: f64, capacity_bps: f64) -> f64 {
    if capacity_bps <= 0.0 {
        return 0.0;
    }
    round2(throughput_bps / capacity_bps * 100.0)
}

pub fn bps_to_gbps(bps: f64) -> f64 {
    round_to(bps / 1e9, THROUGHPUT_DECIMALS)
}

/// Microseconds (as reported by iperf3) to milliseconds, unrounded.
pub fn usec_to_ms(usec: f64) -> f64 {
    usec / 1000.0
}
