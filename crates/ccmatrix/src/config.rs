use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ccmatrix_netsim::{IpVersion, LinkImpairment, TopologySpec};
use serde::Deserialize;

use crate::dataset::SegmentLayout;
use crate::descriptor::ToolMode;
use crate::error::ConfigError;

pub const DEFAULT_ALGORITHMS: [&str; 6] = ["reno", "cubic", "bbr", "vegas", "veno", "westwood"];
pub const DEFAULT_CAPTURE_QUERY: [&str; 5] =
    ["tshark", "-r", "{file}", "-Y", "tcp.analysis.retransmission"];
/// Placeholder in the capture query replaced by the capture file path.
pub const CAPTURE_FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyPreset {
    Switched,
    Routed,
}

/// Whether each cell gets a fresh topology or one is shared by the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyReuse {
    Cell,
    Matrix,
}

// ── Input layer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentConfigInput {
    pub algorithms: Option<Vec<String>>,
    pub protocols: Option<Vec<String>>,
    pub repetitions: Option<u32>,
    pub output_dir: Option<PathBuf>,
    pub segment_layout: Option<SegmentLayout>,
    pub raw_log: Option<bool>,
    pub traffic: TrafficConfigInput,
    pub probe: ProbeConfigInput,
    pub capture: CaptureConfigInput,
    pub topology: TopologyConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrafficConfigInput {
    pub tool: Option<ToolMode>,
    pub duration_s: Option<u64>,
    pub port: Option<u16>,
    pub parallel: Option<u32>,
    pub capacity_gbps: Option<f64>,
    pub settle_delay_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub ready_poll_ms: Option<u64>,
    pub call_grace_s: Option<u64>,
    pub retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub sample_local_cpu: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub count: Option<u32>,
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfigInput {
    pub enabled: Option<bool>,
    pub query: Option<Vec<String>>,
    pub query_timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyConfigInput {
    pub preset: Option<TopologyPreset>,
    pub reuse: Option<TopologyReuse>,
    pub command_timeout_s: Option<u64>,
    /// Every link of the switched preset.
    pub link: LinkInput,
    /// Host links of the routed preset.
    pub access: LinkInput,
    /// Router-to-router link of the routed preset.
    pub transit: LinkInput,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub rate_mbit: Option<f64>,
    pub delay_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    pub netem_limit: Option<u32>,
}

impl LinkInput {
    fn over(self, base: LinkImpairment) -> LinkImpairment {
        LinkImpairment {
            rate_mbit: self.rate_mbit.or(base.rate_mbit),
            delay_ms: self.delay_ms.or(base.delay_ms),
            loss_percent: self.loss_percent.or(base.loss_percent),
            netem_limit: self.netem_limit.or(base.netem_limit),
        }
    }
}

// ── Resolved layer ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub tool: ToolMode,
    pub duration: Duration,
    pub port: u16,
    pub parallel: u32,
    /// Configured link capacity, the denominator of bandwidth efficiency.
    pub capacity_bps: f64,
    pub settle_delay: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    /// Added to the test duration to form the client's hard ceiling.
    pub call_grace: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub sample_local_cpu: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            tool: ToolMode::Iperf3Json,
            duration: Duration::from_secs(30),
            port: 5201,
            parallel: 1,
            capacity_bps: 100e9,
            settle_delay: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(5),
            ready_poll: Duration::from_millis(200),
            call_grace: Duration::from_secs(30),
            retries: 0,
            retry_backoff: Duration::from_secs(2),
            sample_local_cpu: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub count: u32,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 3,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Offline query argv; [`CAPTURE_FILE_PLACEHOLDER`] marks the file.
    pub query: Vec<String>,
    pub query_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            query: DEFAULT_CAPTURE_QUERY.iter().map(|s| s.to_string()).collect(),
            query_timeout: Duration::from_secs(60),
        }
    }
}

impl CaptureConfig {
    pub fn query_for(&self, file: &Path) -> Vec<String> {
        let file = file.display().to_string();
        self.query
            .iter()
            .map(|arg| arg.replace(CAPTURE_FILE_PLACEHOLDER, &file))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub preset: TopologyPreset,
    pub reuse: TopologyReuse,
    /// Ceiling for configuration commands (sysctl, ip, modprobe, ss).
    pub command_timeout: Duration,
    pub link: LinkImpairment,
    pub access: LinkImpairment,
    pub transit: LinkImpairment,
}

impl TopologyConfig {
    pub fn default_link() -> LinkImpairment {
        LinkImpairment {
            rate_mbit: Some(100.0),
            delay_ms: Some(100.0),
            loss_percent: Some(5.0),
            netem_limit: None,
        }
    }

    pub fn default_access() -> LinkImpairment {
        LinkImpairment {
            rate_mbit: Some(100_000.0),
            delay_ms: Some(0.0),
            loss_percent: None,
            netem_limit: None,
        }
    }

    pub fn default_transit() -> LinkImpairment {
        LinkImpairment {
            rate_mbit: Some(100_000.0),
            delay_ms: Some(100.0),
            loss_percent: Some(5.0),
            netem_limit: None,
        }
    }

    /// The topology every cell is provisioned from.
    pub fn spec(&self) -> TopologySpec {
        match self.preset {
            TopologyPreset::Switched => TopologySpec::switched(self.link),
            TopologyPreset::Routed => TopologySpec::routed(self.access, self.transit),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            preset: TopologyPreset::Routed,
            reuse: TopologyReuse::Cell,
            command_timeout: Duration::from_secs(10),
            link: Self::default_link(),
            access: Self::default_access(),
            transit: Self::default_transit(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub algorithms: Vec<String>,
    pub protocols: Vec<IpVersion>,
    pub repetitions: u32,
    pub output_dir: PathBuf,
    pub segment_layout: SegmentLayout,
    pub raw_log: bool,
    pub traffic: TrafficConfig,
    pub probe: ProbeConfig,
    pub capture: CaptureConfig,
    pub topology: TopologyConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            algorithms: DEFAULT_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            protocols: IpVersion::ALL.to_vec(),
            repetitions: 3,
            output_dir: PathBuf::from("results"),
            segment_layout: SegmentLayout::ProtocolAlgorithm,
            raw_log: true,
            traffic: TrafficConfig::default(),
            probe: ProbeConfig::default(),
            capture: CaptureConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub repetitions: Option<u32>,
    pub algorithms: Option<Vec<String>>,
    pub protocols: Option<Vec<String>>,
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

/// Algorithm names end up in sysctl and modprobe arguments.
fn valid_algorithm(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn resolve_algorithms(raw: Vec<String>) -> Result<Vec<String>, ConfigError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in raw {
        let name = name.trim().to_ascii_lowercase();
        if !valid_algorithm(&name) {
            return Err(ConfigError::Invalid(format!(
                "algorithm name `{name}` must be lowercase letters, digits or `_`"
            )));
        }
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Invalid("at least one algorithm is required".into()));
    }
    Ok(out)
}

fn resolve_protocols(raw: Vec<String>) -> Result<Vec<IpVersion>, ConfigError> {
    let mut out = Vec::new();
    for name in raw {
        let version: IpVersion = name.parse().map_err(ConfigError::Invalid)?;
        if !out.contains(&version) {
            out.push(version);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Invalid("at least one protocol is required".into()));
    }
    Ok(out)
}

impl ExperimentConfigInput {
    pub fn resolve(self) -> Result<ExperimentConfig, ConfigError> {
        let defaults = ExperimentConfig::default();

        let algorithms = match self.algorithms {
            Some(raw) => resolve_algorithms(raw)?,
            None => defaults.algorithms,
        };
        let protocols = match self.protocols {
            Some(raw) => resolve_protocols(raw)?,
            None => defaults.protocols,
        };

        let t = self.traffic;
        let td = defaults.traffic;
        let traffic = TrafficConfig {
            tool: t.tool.unwrap_or(td.tool),
            duration: secs(t.duration_s, td.duration),
            port: t.port.unwrap_or(td.port),
            parallel: t.parallel.unwrap_or(td.parallel),
            capacity_bps: t.capacity_gbps.map(|g| g * 1e9).unwrap_or(td.capacity_bps),
            settle_delay: millis(t.settle_delay_ms, td.settle_delay),
            ready_timeout: millis(t.ready_timeout_ms, td.ready_timeout),
            ready_poll: millis(t.ready_poll_ms, td.ready_poll),
            call_grace: secs(t.call_grace_s, td.call_grace),
            retries: t.retries.unwrap_or(td.retries),
            retry_backoff: millis(t.retry_backoff_ms, td.retry_backoff),
            sample_local_cpu: t.sample_local_cpu.unwrap_or(td.sample_local_cpu),
        };

        let probe = ProbeConfig {
            count: self.probe.count.unwrap_or(defaults.probe.count),
            timeout: secs(self.probe.timeout_s, defaults.probe.timeout),
        };

        let c = self.capture;
        let cd = defaults.capture;
        let capture = CaptureConfig {
            enabled: c.enabled.unwrap_or(cd.enabled),
            query: c.query.unwrap_or(cd.query),
            query_timeout: secs(c.query_timeout_s, cd.query_timeout),
        };

        let topo = self.topology;
        let topology = TopologyConfig {
            preset: topo.preset.unwrap_or(defaults.topology.preset),
            reuse: topo.reuse.unwrap_or(defaults.topology.reuse),
            command_timeout: secs(topo.command_timeout_s, defaults.topology.command_timeout),
            link: topo.link.over(TopologyConfig::default_link()),
            access: topo.access.over(TopologyConfig::default_access()),
            transit: topo.transit.over(TopologyConfig::default_transit()),
        };

        let config = ExperimentConfig {
            algorithms,
            protocols,
            repetitions: self.repetitions.unwrap_or(defaults.repetitions),
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            segment_layout: self.segment_layout.unwrap_or(defaults.segment_layout),
            raw_log: self.raw_log.unwrap_or(defaults.raw_log),
            traffic,
            probe,
            capture,
            topology,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ExperimentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(ExperimentConfig::default());
        }
        let parsed: ExperimentConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self, ConfigError> {
        if let Some(dir) = overrides.output_dir {
            self.output_dir = dir;
        }
        if let Some(n) = overrides.repetitions {
            self.repetitions = n;
        }
        if let Some(raw) = overrides.algorithms {
            self.algorithms = resolve_algorithms(raw)?;
        }
        if let Some(raw) = overrides.protocols {
            self.protocols = resolve_protocols(raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Number of cells in the matrix.
    pub fn cell_count(&self) -> usize {
        self.algorithms.len() * self.protocols.len() * self.repetitions as usize
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.repetitions == 0 {
            return invalid("repetitions must be at least 1".into());
        }
        if self.traffic.duration.is_zero() {
            return invalid("traffic.duration_s must be at least 1".into());
        }
        if self.traffic.parallel == 0 {
            return invalid("traffic.parallel must be at least 1".into());
        }
        if self.traffic.port == 0 {
            return invalid("traffic.port must be non-zero".into());
        }
        if !(self.traffic.capacity_bps.is_finite() && self.traffic.capacity_bps > 0.0) {
            return invalid("traffic.capacity_gbps must be positive".into());
        }
        if self.traffic.ready_poll.is_zero() {
            return invalid("traffic.ready_poll_ms must be non-zero".into());
        }
        if self.probe.count == 0 {
            return invalid("probe.count must be at least 1".into());
        }
        if self.capture.enabled
            && !self
                .capture
                .query
                .iter()
                .any(|arg| arg.contains(CAPTURE_FILE_PLACEHOLDER))
        {
            return invalid(format!(
                "capture.query must reference the capture file as `{CAPTURE_FILE_PLACEHOLDER}`"
            ));
        }
        for (name, link) in [
            ("link", &self.topology.link),
            ("access", &self.topology.access),
            ("transit", &self.topology.transit),
        ] {
            if link.loss_percent.is_some_and(|l| !(0.0..=100.0).contains(&l)) {
                return invalid(format!("topology.{name}.loss_percent must be within 0..=100"));
            }
            if link.rate_mbit.is_some_and(|r| r <= 0.0) {
                return invalid(format!("topology.{name}.rate_mbit must be positive"));
            }
            if link.delay_ms.is_some_and(|d| d < 0.0) {
                return invalid(format!("topology.{name}.delay_ms must not be negative"));
            }
        }
        Ok(())
    }
}
