//! Error taxonomy for one matrix cell.
//!
//! Parse problems never show up here: the extractor absorbs them into the
//! record as notes. Everything below is fatal to the cell it happens in and
//! to nothing else, except [`ProvisionError::Exhausted`], which stops the
//! matrix.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::record::Outcome;

// ── Provisioning ────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// The host ran out of a resource the testbed needs.
    #[error("testbed resources exhausted: {0}")]
    Exhausted(String),
    #[error("topology could not be provisioned: {0}")]
    Failed(String),
    #[error("topology teardown failed: {0}")]
    Teardown(String),
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("congestion control `{algorithm}` is not supported on {node} (available: {available})")]
    Unsupported {
        node: String,
        algorithm: String,
        available: String,
    },
    #[error("{node} reports `{actual}` after selecting `{expected}`")]
    NotApplied {
        node: String,
        expected: String,
        actual: String,
    },
    #[error("{what} on {node} failed: {detail}")]
    Command {
        node: String,
        what: String,
        detail: String,
    },
}

// ── Measurement ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("traffic sink on {node} was not listening on port {port} after {waited:?}: {detail}")]
    SinkNotReady {
        node: String,
        port: u16,
        waited: Duration,
        detail: String,
    },
    #[error("{tool} could not connect: {detail}")]
    Connect { tool: String, detail: String },
    #[error("{tool} exceeded its {ceiling:?} ceiling")]
    Timeout { tool: String, ceiling: Duration },
    #[error("{node} has no {version} address")]
    NoAddress { node: String, version: String },
    #[error("{tool} failed: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("measurement interrupted by shutdown")]
    Interrupted,
}

impl MeasureError {
    /// Classify an exec failure of `tool` run under `ceiling`.
    pub fn from_exec(tool: &str, ceiling: Duration, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => MeasureError::Timeout {
                tool: tool.to_string(),
                ceiling,
            },
            io::ErrorKind::Interrupted => MeasureError::Interrupted,
            _ => MeasureError::Io {
                tool: tool.to_string(),
                source: err,
            },
        }
    }

    /// Failures at the sink/source rendezvous, where another attempt can
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeasureError::SinkNotReady { .. } | MeasureError::Connect { .. }
        )
    }
}

// ── Persistence ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("dataset I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("dataset encoding for {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

// ── Configuration file ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Cell ────────────────────────────────────────────────────────────

/// Why a matrix cell failed.
#[derive(Debug, Error)]
pub enum CellError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Configure(#[from] ConfigureError),
    #[error(transparent)]
    Measure(#[from] MeasureError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl CellError {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CellError::Provision(ProvisionError::Exhausted(_)) => "exhausted",
            CellError::Provision(_) => "provision",
            CellError::Configure(_) => "configure",
            CellError::Measure(MeasureError::Timeout { .. })
            | CellError::Measure(MeasureError::SinkNotReady { .. }) => "timing",
            CellError::Measure(_) => "measure",
            CellError::Persist(_) => "persist",
        }
    }

    /// Outcome recorded in the degraded row for this failure.
    pub fn outcome(&self) -> Outcome {
        match self {
            CellError::Provision(_) => Outcome::ProvisionFailed,
            CellError::Configure(_) => Outcome::ConfigureFailed,
            CellError::Measure(_) | CellError::Persist(_) => Outcome::MeasureFailed,
        }
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self, CellError::Provision(ProvisionError::Exhausted(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_errors_are_classified() {
        let ceiling = Duration::from_secs(3);
        let timeout = MeasureError::from_exec(
            "iperf3",
            ceiling,
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
        );
        assert!(matches!(timeout, MeasureError::Timeout { .. }));
        assert_eq!(CellError::from(timeout).kind(), "timing");

        let interrupted = MeasureError::from_exec(
            "ping",
            ceiling,
            io::Error::new(io::ErrorKind::Interrupted, "signal"),
        );
        assert!(matches!(interrupted, MeasureError::Interrupted));

        let other = MeasureError::from_exec("ping", ceiling, io::Error::other("boom"));
        assert!(other.to_string().contains("ping failed: boom"));
    }

    #[test]
    fn only_rendezvous_failures_retry() {
        let not_ready = MeasureError::SinkNotReady {
            node: "h2".into(),
            port: 5201,
            waited: Duration::from_secs(1),
            detail: "no listener".into(),
        };
        assert!(not_ready.is_retryable());
        assert!(MeasureError::Connect {
            tool: "iperf3".into(),
            detail: "refused".into()
        }
        .is_retryable());
        assert!(!MeasureError::Interrupted.is_retryable());
    }

    #[test]
    fn outcomes_follow_stage() {
        let err = CellError::from(ProvisionError::Exhausted("ENOSPC".into()));
        assert!(err.is_exhaustion());
        assert_eq!(err.outcome(), Outcome::ProvisionFailed);

        let err = CellError::from(ConfigureError::Unsupported {
            node: "h1".into(),
            algorithm: "hybla".into(),
            available: "reno cubic".into(),
        });
        assert_eq!(err.kind(), "configure");
        assert_eq!(err.outcome(), Outcome::ConfigureFailed);
        assert!(err.to_string().contains("`hybla` is not supported on h1"));
    }
}
