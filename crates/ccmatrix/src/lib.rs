//! TCP congestion-control experiment matrix engine.
//!
//! For every {algorithm, IP version, repetition} cell the [`matrix::Controller`]
//! provisions an emulated topology, selects the algorithm on its hosts, runs
//! a traffic test plus a connectivity probe, turns the tool output into a
//! [`record::MetricsRecord`] and appends it to a CSV segment.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration, defaults and CLI overrides
//! - [`descriptor`]: run descriptors and matrix enumeration
//! - [`testbed`]: the `Testbed` / `Topology` seam and its netns backing
//! - [`driver`]: congestion control, addresses, forwarding, routes
//! - [`runner`]: traffic test and probe sequencing
//! - [`extract`]: JSON and text report extraction
//! - [`stats`]: derived statistics
//! - [`dataset`]: append-only CSV segments and the raw output log
//! - [`matrix`]: the per-cell state machine and run summary

pub mod config;
pub mod dataset;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod extract;
pub mod matrix;
pub mod record;
pub mod runner;
pub mod shutdown;
pub mod stats;
pub mod testbed;

pub use ccmatrix_netsim::{CommandOutput, IpVersion, TopologySpec};
pub use config::ExperimentConfig;
pub use matrix::{Controller, MatrixReport, StopReason};
pub use record::{MetricsRecord, Outcome};
