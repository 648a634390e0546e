//! Run descriptors and matrix enumeration.

use std::fmt;
use std::time::Duration;

use ccmatrix_netsim::IpVersion;
use serde::Deserialize;

use crate::config::ExperimentConfig;

/// Which traffic tool drives a cell and how its output is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolMode {
    /// `iperf3 -J`, decoded as JSON.
    Iperf3Json,
    /// `iperf` (version 2), scanned as text.
    IperfText,
}

impl ToolMode {
    pub fn binary(self) -> &'static str {
        match self {
            ToolMode::Iperf3Json => "iperf3",
            ToolMode::IperfText => "iperf",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficParams {
    pub tool: ToolMode,
    pub port: u16,
    pub parallel: u32,
    pub probe_count: u32,
    pub capture: bool,
}

/// One cell of the matrix. Identifies exactly one dataset row.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDescriptor {
    pub algorithm: String,
    pub protocol: IpVersion,
    /// 1-based.
    pub repetition: u32,
    pub duration: Duration,
    pub traffic: TrafficParams,
}

impl fmt::Display for RunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/#{} ({}, {}s)",
            self.algorithm,
            self.protocol,
            self.repetition,
            self.traffic.tool.binary(),
            self.duration.as_secs()
        )
    }
}

/// Every cell of the matrix: algorithm outermost, then protocol, then
/// repetition.
pub fn enumerate(config: &ExperimentConfig) -> Vec<RunDescriptor> {
    let traffic = TrafficParams {
        tool: config.traffic.tool,
        port: config.traffic.port,
        parallel: config.traffic.parallel,
        probe_count: config.probe.count,
        capture: config.capture.enabled,
    };
    let mut cells = Vec::with_capacity(config.cell_count());
    for algorithm in &config.algorithms {
        for &protocol in &config.protocols {
            for repetition in 1..=config.repetitions {
                cells.push(RunDescriptor {
                    algorithm: algorithm.clone(),
                    protocol,
                    repetition,
                    duration: config.traffic.duration,
                    traffic: traffic.clone(),
                });
            }
        }
    }
    cells
}
