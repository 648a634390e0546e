//! Traffic test and connectivity probe for one cell.
//!
//! Sink startup, readiness, capture, client run and cleanup are strictly
//! ordered. The sink and the capture are stopped on every path out of a
//! traffic attempt.

use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use ccmatrix_netsim::IpVersion;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::{CaptureConfig, ProbeConfig, TrafficConfig};
use crate::descriptor::{RunDescriptor, ToolMode};
use crate::error::MeasureError;
use crate::testbed::{Background, Topology};

/// Two samples this far apart give one CPU utilisation reading.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Output fragments of a client that never reached the sink.
const CONNECT_FAILURE_MARKERS: &[&str] = &[
    "unable to connect",
    "connect failed",
    "Connection refused",
    "No route to host",
    "Network is unreachable",
];

/// Output and exit status of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRun {
    pub output: String,
    pub exit_code: Option<i32>,
}

/// What the capture tool saw during the traffic test.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvidence {
    pub query_output: String,
    /// From capture start until the query over the capture finished.
    pub window: Duration,
}

/// Everything a cell's measurement produced, before interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawCapture {
    pub traffic: Option<ToolRun>,
    pub probe: Option<ToolRun>,
    pub evidence: Option<CaptureEvidence>,
    pub local_cpu_pct: Option<f64>,
    pub started: Option<Instant>,
    pub elapsed: Duration,
    /// Problems that did not stop the measurement.
    pub notes: Vec<String>,
}

fn to_argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

struct ActiveCapture {
    process: Box<dyn Background>,
    // Deleted on drop, after the query has read it.
    file: tempfile::TempPath,
    started: Instant,
}

pub struct Runner<'a> {
    topology: &'a dyn Topology,
    traffic: &'a TrafficConfig,
    probe: &'a ProbeConfig,
    capture: &'a CaptureConfig,
    command_timeout: Duration,
}

impl<'a> Runner<'a> {
    pub fn new(
        topology: &'a dyn Topology,
        traffic: &'a TrafficConfig,
        probe: &'a ProbeConfig,
        capture: &'a CaptureConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            traffic,
            probe,
            capture,
            command_timeout,
        }
    }

    fn target(&self, node: &str, protocol: IpVersion) -> Result<IpAddr, MeasureError> {
        self.topology
            .spec()
            .address(node, protocol)
            .ok_or_else(|| MeasureError::NoAddress {
                node: node.to_string(),
                version: protocol.label().to_string(),
            })
    }

    /// Traffic test followed by the probe, source to sink.
    pub fn measure(&self, descriptor: &RunDescriptor) -> Result<RawCapture, MeasureError> {
        let spec = self.topology.spec();
        let (source, sink) = (spec.source.as_str(), spec.sink.as_str());

        let mut raw = self.run_traffic_test(source, sink, descriptor)?;
        let target = self.target(sink, descriptor.protocol)?;
        raw.probe = Some(self.run_probe(source, target, descriptor.protocol, descriptor.traffic.probe_count)?);
        Ok(raw)
    }

    /// Run the traffic tool from `source` to `sink`, retrying only when the
    /// sink never became ready or the client could not connect.
    pub fn run_traffic_test(
        &self,
        source: &str,
        sink: &str,
        descriptor: &RunDescriptor,
    ) -> Result<RawCapture, MeasureError> {
        let mut attempt = 0u32;
        loop {
            match self.traffic_attempt(source, sink, descriptor) {
                Err(e) if e.is_retryable() && attempt < self.traffic.retries => {
                    attempt += 1;
                    let backoff = self.traffic.retry_backoff * attempt;
                    warn!(
                        cell = %descriptor,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "traffic attempt failed, retrying"
                    );
                    std::thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }

    fn traffic_attempt(
        &self,
        source: &str,
        sink: &str,
        descriptor: &RunDescriptor,
    ) -> Result<RawCapture, MeasureError> {
        let tool = descriptor.traffic.tool;
        let sink_argv = sink_command(tool, descriptor.traffic.port, descriptor.protocol);
        let mut sink_process = self
            .topology
            .spawn(sink, &sink_argv)
            .map_err(|e| MeasureError::Io {
                tool: format!("{} sink", tool.binary()),
                source: e,
            })?;

        let result = self.drive(source, sink, descriptor, sink_process.as_mut());

        let sink_output = sink_process.stop();
        debug!(node = sink, bytes = sink_output.len(), "traffic sink stopped");
        result
    }

    fn drive(
        &self,
        source: &str,
        sink: &str,
        descriptor: &RunDescriptor,
        sink_process: &mut dyn Background,
    ) -> Result<RawCapture, MeasureError> {
        let tool = descriptor.traffic.tool;
        self.wait_ready(sink, descriptor.traffic.port, sink_process)?;

        let target = self.target(sink, descriptor.protocol)?;
        let mut raw = RawCapture::default();

        let active = if descriptor.traffic.capture {
            match self.start_capture(source) {
                Ok(active) => Some(active),
                Err(note) => {
                    warn!(node = source, note = %note, "continuing without packet capture");
                    raw.notes.push(note);
                    None
                }
            }
        } else {
            None
        };

        let cpu_before = self.sample_local_cpu();
        let client_argv = client_command(
            tool,
            target,
            descriptor.traffic.port,
            descriptor.duration,
            descriptor.traffic.parallel,
        );
        let ceiling = descriptor.duration + self.traffic.call_grace;
        let started = Instant::now();
        info!(cell = %descriptor, node = source, cmd = %client_argv.join(" "), "traffic test started");
        let client = self.topology.exec(source, &client_argv, ceiling);
        raw.elapsed = started.elapsed();
        raw.started = Some(started);
        let cpu_after = self.sample_local_cpu();

        if let Some(active) = active {
            raw.evidence = self.finish_capture(source, active, &mut raw.notes);
        }

        let client = client.map_err(|e| MeasureError::from_exec(tool.binary(), ceiling, e))?;
        let output = client.combined();
        if !client.success() {
            if let Some(marker) = CONNECT_FAILURE_MARKERS.iter().find(|m| output.contains(**m)) {
                return Err(MeasureError::Connect {
                    tool: tool.binary().to_string(),
                    detail: (*marker).to_string(),
                });
            }
        }

        raw.local_cpu_pct = match (cpu_before, cpu_after) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (a, b) => a.or(b),
        };
        raw.traffic = Some(ToolRun {
            output,
            exit_code: client.status,
        });
        Ok(raw)
    }

    /// Wait `settle_delay`, then poll the sink node's listening sockets until
    /// `port` shows up or `ready_timeout` runs out.
    fn wait_ready(&self, node: &str, port: u16, sink: &mut dyn Background) -> Result<(), MeasureError> {
        std::thread::sleep(self.traffic.settle_delay);
        let started = Instant::now();
        let check = to_argv(["ss", "-tln"]);
        let mut last = String::new();
        loop {
            if !sink.is_alive() {
                let output = sink.stop();
                return Err(MeasureError::SinkNotReady {
                    node: node.to_string(),
                    port,
                    waited: started.elapsed(),
                    detail: format!("sink exited: {}", output.trim()),
                });
            }
            match self.topology.exec(node, &check, self.command_timeout) {
                Ok(out) if is_listening(&out.stdout, port) => {
                    debug!(node, port, waited_ms = started.elapsed().as_millis() as u64, "sink ready");
                    return Ok(());
                }
                Ok(out) => last = out.combined(),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    return Err(MeasureError::Interrupted)
                }
                Err(e) => last = e.to_string(),
            }
            if started.elapsed() >= self.traffic.ready_timeout {
                return Err(MeasureError::SinkNotReady {
                    node: node.to_string(),
                    port,
                    waited: started.elapsed(),
                    detail: if last.trim().is_empty() {
                        "no listener".into()
                    } else {
                        format!("no listener ({})", last.lines().next().unwrap_or_default())
                    },
                });
            }
            std::thread::sleep(self.traffic.ready_poll);
        }
    }

    fn start_capture(&self, source: &str) -> Result<ActiveCapture, String> {
        let interface = self
            .topology
            .spec()
            .interface(source)
            .ok_or_else(|| format!("capture: {source} has no interface"))?
            .to_string();
        let file = tempfile::Builder::new()
            .prefix("ccmatrix-")
            .suffix(".pcap")
            .tempfile()
            .map_err(|e| format!("capture: temporary file: {e}"))?
            .into_temp_path();
        let argv = capture_command(&interface, &file);
        let started = Instant::now();
        let process = self
            .topology
            .spawn(source, &argv)
            .map_err(|e| format!("capture: tcpdump failed to start: {e}"))?;
        // tcpdump needs a moment to open the interface.
        std::thread::sleep(self.traffic.settle_delay);
        Ok(ActiveCapture {
            process,
            file,
            started,
        })
    }

    /// Stop the capture and query it. The detection window closes when the
    /// query returns.
    fn finish_capture(
        &self,
        source: &str,
        mut active: ActiveCapture,
        notes: &mut Vec<String>,
    ) -> Option<CaptureEvidence> {
        let capture_log = active.process.stop();
        debug!(node = source, output = %capture_log.trim(), "capture stopped");

        let query = self.capture.query_for(&active.file);
        let result = self.topology.exec(source, &query, self.capture.query_timeout);
        let window = active.started.elapsed();
        match result {
            Ok(out) if out.success() => Some(CaptureEvidence {
                query_output: out.stdout,
                window,
            }),
            Ok(out) => {
                notes.push(format!(
                    "capture query exited with {:?}: {}",
                    out.status,
                    out.combined().trim()
                ));
                None
            }
            Err(e) => {
                notes.push(format!("capture query failed: {e}"));
                None
            }
        }
    }

    /// Probe `target` from `source`. A non-zero exit still yields the text.
    pub fn run_probe(
        &self,
        source: &str,
        target: IpAddr,
        protocol: IpVersion,
        count: u32,
    ) -> Result<ToolRun, MeasureError> {
        let argv = probe_command(target, protocol, count);
        let out = self
            .topology
            .exec(source, &argv, self.probe.timeout)
            .map_err(|e| MeasureError::from_exec("ping", self.probe.timeout, e))?;
        if !out.success() {
            debug!(node = source, status = ?out.status, "probe exited non-zero");
        }
        Ok(ToolRun {
            output: out.combined(),
            exit_code: out.status,
        })
    }

    fn sample_local_cpu(&self) -> Option<f64> {
        if !self.traffic.sample_local_cpu {
            return None;
        }
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(CPU_SAMPLE_INTERVAL.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_cpu_usage();
        Some(f64::from(sys.global_cpu_usage()))
    }
}

pub fn sink_command(tool: ToolMode, port: u16, protocol: IpVersion) -> Vec<String> {
    let port = port.to_string();
    match tool {
        ToolMode::Iperf3Json => to_argv(["iperf3", "-s", "-p", port.as_str()]),
        ToolMode::IperfText => {
            let mut argv = to_argv(["iperf", "-s"]);
            if protocol.is_v6() {
                argv.push("-V".into());
            }
            argv.extend(to_argv(["-p", port.as_str()]));
            argv
        }
    }
}

pub fn client_command(
    tool: ToolMode,
    target: IpAddr,
    port: u16,
    duration: Duration,
    parallel: u32,
) -> Vec<String> {
    let target = target.to_string();
    let port = port.to_string();
    let secs = duration.as_secs().max(1).to_string();
    let mut argv = to_argv([tool.binary(), "-c", target.as_str(), "-p", port.as_str(), "-t", secs.as_str()]);
    match tool {
        ToolMode::Iperf3Json => argv.push("-J".into()),
        ToolMode::IperfText => argv.extend(to_argv(["-i", "1"])),
    }
    if target.contains(':') {
        argv.push(match tool {
            ToolMode::Iperf3Json => "-6".into(),
            ToolMode::IperfText => "-V".into(),
        });
    }
    if parallel > 1 {
        argv.extend(to_argv(["-P".to_string(), parallel.to_string()]));
    }
    argv
}

pub fn probe_command(target: IpAddr, protocol: IpVersion, count: u32) -> Vec<String> {
    let mut argv = to_argv(["ping"]);
    if protocol.is_v6() {
        argv.push("-6".into());
    }
    argv.extend(to_argv(["-c".to_string(), count.to_string(), target.to_string()]));
    argv
}

fn capture_command(interface: &str, file: &Path) -> Vec<String> {
    let file = file.display().to_string();
    // -U flushes per packet so the file is complete when tcpdump is stopped;
    // -Z root keeps it from dropping privileges away from the file.
    to_argv(["tcpdump", "-i", interface, "-U", "-s", "128", "-Z", "root", "-w", file.as_str()])
}

/// Whether `ss -tln` output lists a socket listening on `port`.
pub fn is_listening(ss_output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    ss_output
        .lines()
        .filter(|line| line.starts_with("LISTEN"))
        .any(|line| line.split_whitespace().nth(3).is_some_and(|local| local.ends_with(&suffix)))
}
