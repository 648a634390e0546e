//! Sequencing of the experiment matrix.
//!
//! Each cell runs PROVISION, CONFIGURE, MEASURE, PERSIST and TEARDOWN in that
//! order. A failing cell still leaves a row behind and the run moves on; only
//! testbed exhaustion and operator shutdown end it early.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use ccmatrix_netsim::TopologySpec;
use tracing::{error, info, warn};

use crate::config::{ExperimentConfig, TopologyReuse};
use crate::dataset::{DatasetWriter, RawLog};
use crate::descriptor::{enumerate, RunDescriptor};
use crate::driver::{AppliedSettings, Driver};
use crate::error::{CellError, PersistError, ProvisionError};
use crate::extract::{self, Extractor};
use crate::record::{MetricsRecord, Outcome};
use crate::runner::Runner;
use crate::shutdown::ShutdownFlag;
use crate::testbed::{Testbed, Topology, TopologyGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Exhausted(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Interrupted => f.write_str("interrupted"),
            StopReason::Exhausted(msg) => write!(f, "testbed exhausted: {msg}"),
        }
    }
}

/// Summary of one matrix run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixReport {
    pub planned: usize,
    pub attempted: usize,
    pub ok: usize,
    pub degraded: usize,
    pub failed: usize,
    pub unpersisted: usize,
    pub teardown_failures: usize,
    pub stopped: Option<StopReason>,
    pub segments: BTreeSet<PathBuf>,
}

impl MatrixReport {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Degraded => self.degraded += 1,
            _ => self.failed += 1,
        }
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> u8 {
        match &self.stopped {
            Some(StopReason::Interrupted) => 130,
            Some(StopReason::Exhausted(_)) => 1,
            None if self.unpersisted > 0 => 2,
            None => 0,
        }
    }
}

pub struct Controller<'a> {
    config: &'a ExperimentConfig,
    testbed: &'a dyn Testbed,
    shutdown: ShutdownFlag,
    spec: TopologySpec,
    writer: DatasetWriter,
    raw_log: Option<RawLog>,
    extractor: Box<dyn Extractor>,
}

impl<'a> Controller<'a> {
    pub fn new(
        config: &'a ExperimentConfig,
        testbed: &'a dyn Testbed,
        shutdown: ShutdownFlag,
    ) -> Result<Self, PersistError> {
        let writer = DatasetWriter::new(&config.output_dir, config.segment_layout)?;
        let raw_log = if config.raw_log {
            Some(RawLog::open(writer.dir())?)
        } else {
            None
        };
        Ok(Self {
            config,
            testbed,
            shutdown,
            spec: config.topology.spec(),
            writer,
            raw_log,
            extractor: extract::for_tool(config.traffic.tool),
        })
    }

    pub fn run(&mut self) -> MatrixReport {
        let cells = enumerate(self.config);
        let mut report = MatrixReport {
            planned: cells.len(),
            ..Default::default()
        };
        info!(
            cells = cells.len(),
            algorithms = self.config.algorithms.len(),
            protocols = self.config.protocols.len(),
            repetitions = self.config.repetitions,
            output_dir = %self.writer.dir().display(),
            "matrix started"
        );

        let mut shared = None;
        let mut shared_err = None;
        if self.config.topology.reuse == TopologyReuse::Matrix {
            match self.testbed.provision(&self.spec) {
                Ok(topology) => shared = Some(TopologyGuard::new(topology)),
                Err(e) => {
                    error!(error = %e, "shared topology could not be provisioned");
                    shared_err = Some(e);
                }
            }
        }

        for descriptor in &cells {
            if self.shutdown.is_raised() {
                report.stopped = Some(StopReason::Interrupted);
                break;
            }
            if let Some(reason) = self.run_cell(descriptor, shared.as_ref(), shared_err.as_ref(), &mut report) {
                report.stopped = Some(reason);
                break;
            }
        }
        if report.stopped.is_none() && self.shutdown.is_raised() {
            report.stopped = Some(StopReason::Interrupted);
        }

        if let Some(guard) = shared {
            if let Err(e) = guard.teardown() {
                warn!(error = %e, "shared topology teardown failed");
                report.teardown_failures += 1;
            }
        }

        match &report.stopped {
            Some(reason) => warn!(
                attempted = report.attempted,
                planned = report.planned,
                reason = %reason,
                "matrix stopped early"
            ),
            None => info!(
                attempted = report.attempted,
                ok = report.ok,
                degraded = report.degraded,
                failed = report.failed,
                unpersisted = report.unpersisted,
                "matrix finished"
            ),
        }
        report
    }

    /// One cell end to end. Returns why the matrix must stop, if it must.
    fn run_cell(
        &mut self,
        descriptor: &RunDescriptor,
        shared: Option<&TopologyGuard>,
        shared_err: Option<&ProvisionError>,
        report: &mut MatrixReport,
    ) -> Option<StopReason> {
        report.attempted += 1;

        let mut local = None;
        let result = match (shared, shared_err) {
            (Some(guard), _) => self.measure_cell(guard.topology(), descriptor),
            (None, Some(e)) => Err(CellError::Provision(e.clone())),
            (None, None) => match self.testbed.provision(&self.spec) {
                Ok(topology) => {
                    let guard: &mut TopologyGuard = local.insert(TopologyGuard::new(topology));
                    self.measure_cell(guard.topology(), descriptor)
                }
                Err(e) => Err(CellError::Provision(e)),
            },
        };

        let (record, stop) = match result {
            Ok(record) => (record, None),
            Err(e) => {
                error!(descriptor = ?descriptor, kind = e.kind(), error = %e, "cell failed");
                let stop = if e.is_exhaustion() {
                    Some(StopReason::Exhausted(e.to_string()))
                } else if self.shutdown.is_raised() {
                    Some(StopReason::Interrupted)
                } else {
                    None
                };
                (MetricsRecord::failed(descriptor, &e), stop)
            }
        };
        report.count(record.outcome);

        match self.writer.append_run(descriptor, &record) {
            Ok(path) => {
                report.segments.insert(path);
            }
            Err(e) => {
                let e = CellError::from(e);
                error!(descriptor = ?descriptor, kind = e.kind(), error = %e, "row not persisted");
                report.unpersisted += 1;
            }
        }

        info!(
            algorithm = %descriptor.algorithm,
            protocol = %descriptor.protocol,
            repetition = descriptor.repetition,
            outcome = %record.outcome,
            throughput_gbps = record.throughput_gbps,
            "cell finished"
        );

        if let Some(guard) = local {
            if let Err(e) = guard.teardown() {
                warn!(cell = %descriptor, error = %e, "teardown failed");
                report.teardown_failures += 1;
            }
        }
        stop
    }

    /// CONFIGURE and MEASURE on `topology`. On a shared topology the
    /// cell's settings are put back afterwards.
    fn measure_cell(&self, topology: &dyn Topology, descriptor: &RunDescriptor) -> Result<MetricsRecord, CellError> {
        let driver = Driver::new(topology, self.config.topology.command_timeout);
        let mut applied = AppliedSettings::default();
        let result = self.configure_and_measure(&driver, topology, descriptor, &mut applied);
        if self.config.topology.reuse == TopologyReuse::Matrix && !applied.is_empty() {
            if let Err(e) = driver.restore(&mut applied) {
                warn!(cell = %descriptor, error = %e, "settings not restored");
            }
        }
        result
    }

    fn configure_and_measure(
        &self,
        driver: &Driver<'_>,
        topology: &dyn Topology,
        descriptor: &RunDescriptor,
        applied: &mut AppliedSettings,
    ) -> Result<MetricsRecord, CellError> {
        driver.configure(descriptor, applied)?;

        let runner = Runner::new(
            topology,
            &self.config.traffic,
            &self.config.probe,
            &self.config.capture,
            self.config.topology.command_timeout,
        );
        let raw = runner.measure(descriptor)?;
        if let Some(log) = &self.raw_log {
            if let Err(e) = log.append(descriptor, &raw) {
                warn!(cell = %descriptor, error = %e, "raw output not logged");
            }
        }

        let record = self
            .extractor
            .extract(descriptor, &raw, self.config.traffic.capacity_bps);
        if record.outcome == Outcome::Degraded {
            warn!(cell = %descriptor, note = %record.note, "measurement degraded");
        }
        Ok(record)
    }
}
