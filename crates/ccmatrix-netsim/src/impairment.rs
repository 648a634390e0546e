use crate::topology::Namespace;
use std::io;

/// Link impairment applied via `tc netem` on one end of a link.
///
/// All fields are optional; only non-`None` parameters are passed to netem.
/// If every field is `None`, any existing root qdisc is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkImpairment {
    /// Bandwidth cap in Mbit/s.
    pub rate_mbit: Option<f64>,
    /// One-way propagation delay in milliseconds.
    pub delay_ms: Option<f64>,
    /// Random loss in percent.
    pub loss_percent: Option<f64>,
    /// Override the netem queue `limit` (in packets). When `None` and
    /// `rate_mbit` is set, a limit of roughly 2× the bandwidth-delay product
    /// is derived so the queue stays finite and excess packets are dropped.
    pub netem_limit: Option<u32>,
}

/// Packet size used to turn a BDP in bytes into a queue limit in packets.
const MTU_BYTES: u64 = 1500;
/// Assumed one-way delay for BDP sizing when the link sets none.
const DEFAULT_BDP_DELAY_MS: f64 = 20.0;
const MIN_LIMIT_PACKETS: u64 = 20;

impl LinkImpairment {
    pub fn is_empty(&self) -> bool {
        self.rate_mbit.is_none() && self.delay_ms.is_none() && self.loss_percent.is_none()
    }

    /// Queue limit in packets, explicit or derived from the BDP.
    pub fn queue_limit(&self) -> Option<u32> {
        if let Some(explicit) = self.netem_limit {
            return Some(explicit);
        }
        let rate = self.rate_mbit?;
        let delay_ms = self.delay_ms.filter(|d| *d > 0.0).unwrap_or(DEFAULT_BDP_DELAY_MS);
        let rtt_ms = delay_ms * 2.0;
        let bdp_bytes = (rate * 1_000_000.0 / 8.0 * rtt_ms / 1000.0) as u64;
        let packets = (bdp_bytes / MTU_BYTES).saturating_mul(2).max(MIN_LIMIT_PACKETS);
        Some(packets.min(u32::MAX as u64) as u32)
    }

    /// Arguments to `tc` that install this impairment as the root qdisc.
    pub fn netem_args(&self, interface: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            interface.into(),
            "root".into(),
            "netem".into(),
        ];

        if let Some(limit) = self.queue_limit() {
            args.push("limit".into());
            args.push(limit.to_string());
        }
        if let Some(delay) = self.delay_ms {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
        }
        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }
        if let Some(rate) = self.rate_mbit {
            args.push("rate".into());
            args.push(format!("{}kbit", (rate * 1000.0).round() as u64));
        }
        args
    }
}

/// Applies `impairment` to `interface` inside `ns`.
///
/// Removes any existing root qdisc first, then installs netem with the
/// configured rate, delay and loss.
pub fn apply_impairment(ns: &Namespace, interface: &str, impairment: &LinkImpairment) -> io::Result<()> {
    // Best effort: there is usually no root qdisc to remove yet.
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    if impairment.is_empty() {
        return Ok(());
    }

    let args_storage = impairment.netem_args(interface);
    let args: Vec<&str> = args_storage.iter().map(|s| s.as_str()).collect();
    let output = ns.exec("tc", &args)?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to apply tc netem: {}\nCommand: tc {}",
            String::from_utf8_lossy(&output.stderr),
            args.join(" ")
        )));
    }

    tracing::debug!(namespace = %ns.name, interface, cmd = %args.join(" "), "netem applied");
    Ok(())
}
