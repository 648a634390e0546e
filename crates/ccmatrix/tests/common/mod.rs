//! Scripted testbed: canned tool output, recorded commands, counted
//! provisioning and teardown.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ccmatrix::config::ExperimentConfig;
use ccmatrix::error::ProvisionError;
use ccmatrix::shutdown::ShutdownFlag;
use ccmatrix::testbed::{Background, Testbed, Topology};
use ccmatrix::{CommandOutput, TopologySpec};

pub const KERNEL_ALGORITHMS: [&str; 6] = ["reno", "cubic", "bbr", "vegas", "veno", "westwood"];

pub const IPERF3_REPORT: &str = r#"{
  "start": { "tcp_mss_default": 1460 },
  "intervals": [
    { "streams": [ { "rtt": 1000 } ] },
    { "streams": [ { "rtt": 2000 } ] },
    { "streams": [ { "rtt": 3000 } ] },
    { "streams": [ { "rtt": 4000 } ] }
  ],
  "end": {
    "sum_sent": { "retransmits": 2, "bytes": 1000000 },
    "sum_received": { "bits_per_second": 5000000000 },
    "streams": [ { "sender": { "mean_rtt": 2500, "max_rtt": 4000, "max_snd_cwnd": 64240 } } ],
    "cpu_utilization_percent": { "host_total": 10.5, "remote_total": 2.25 }
  }
}"#;

pub const PING_OUTPUT: &str = "\
PING 10.0.2.2 (10.0.2.2) 56(84) bytes of data.

--- 10.0.2.2 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 200.112/200.650/201.188/0.538 ms
";

pub const TSHARK_RETRANSMISSION: &str =
    "  42 3.101 10.0.1.2 → 10.0.2.2 TCP 1514 [TCP Retransmission] 40312 → 5201 [ACK]\n";

/// What every tool answers.
#[derive(Clone)]
pub struct Script {
    pub traffic_output: String,
    pub traffic_status: i32,
    pub probe_output: String,
    pub query_output: String,
    /// Algorithms the fake kernel cannot provide.
    pub unsupported: Vec<String>,
    /// 1-based provisioning attempts that fail.
    pub fail_provision: Vec<usize>,
    /// 1-based provisioning attempt that reports resource exhaustion.
    pub exhaust_on: Option<usize>,
    pub sink_never_ready: bool,
    /// This many client runs fail with "Connection refused" first.
    pub connect_failures: usize,
    /// Raised during the first client run, which then reports `Interrupted`.
    pub interrupt: Option<ShutdownFlag>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            traffic_output: IPERF3_REPORT.into(),
            traffic_status: 0,
            probe_output: PING_OUTPUT.into(),
            query_output: TSHARK_RETRANSMISSION.into(),
            unsupported: Vec::new(),
            fail_provision: Vec::new(),
            exhaust_on: None,
            sink_never_ready: false,
            connect_failures: 0,
            interrupt: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Events {
    pub provision_attempts: usize,
    pub provisioned: usize,
    pub teardowns: usize,
    pub live: usize,
    pub max_live: usize,
    pub client_runs: usize,
    pub spawned: Vec<String>,
    pub stopped: usize,
    /// (topology id, node, command line)
    pub commands: Vec<(usize, String, String)>,
}

impl Events {
    pub fn commands_matching(&self, prefix: &str) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|(_, _, c)| c.starts_with(prefix))
            .map(|(_, _, c)| c.as_str())
            .collect()
    }
}

pub struct FakeTestbed {
    pub script: Script,
    pub events: Arc<Mutex<Events>>,
}

impl FakeTestbed {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            events: Arc::new(Mutex::new(Events::default())),
        }
    }

    pub fn events(&self) -> std::sync::MutexGuard<'_, Events> {
        self.events.lock().unwrap()
    }
}

impl Testbed for FakeTestbed {
    fn provision(&self, spec: &TopologySpec) -> Result<Box<dyn Topology>, ProvisionError> {
        let mut events = self.events.lock().unwrap();
        events.provision_attempts += 1;
        let attempt = events.provision_attempts;
        if self.script.exhaust_on == Some(attempt) {
            return Err(ProvisionError::Exhausted(
                "create namespace: No space left on device".into(),
            ));
        }
        if self.script.fail_provision.contains(&attempt) {
            return Err(ProvisionError::Failed("veth pair: RTNETLINK answers: File exists".into()));
        }
        events.provisioned += 1;
        events.live += 1;
        events.max_live = events.max_live.max(events.live);

        let current = spec
            .nodes
            .iter()
            .map(|n| (n.name.clone(), "cubic".to_string()))
            .collect();
        Ok(Box::new(FakeTopology {
            id: attempt,
            spec: spec.clone(),
            script: self.script.clone(),
            events: Arc::clone(&self.events),
            algorithms: Mutex::new(current),
        }))
    }
}

pub struct FakeTopology {
    id: usize,
    spec: TopologySpec,
    script: Script,
    events: Arc<Mutex<Events>>,
    algorithms: Mutex<HashMap<String, String>>,
}

fn out(status: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: stdout.into(),
        stderr: stderr.into(),
        elapsed: Duration::from_millis(1),
    }
}

impl FakeTopology {
    fn available(&self) -> Vec<&'static str> {
        KERNEL_ALGORITHMS
            .iter()
            .copied()
            .filter(|a| !self.script.unsupported.iter().any(|u| u == a))
            .collect()
    }
}

impl Topology for FakeTopology {
    fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    fn exec(&self, node: &str, argv: &[String], _timeout: Duration) -> io::Result<CommandOutput> {
        let line = argv.join(" ");
        let mut events = self.events.lock().unwrap();
        events.commands.push((self.id, node.to_string(), line));
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();

        let output = match args.as_slice() {
            ["sysctl", "-n", "net.ipv4.tcp_congestion_control"] => {
                let current = self.algorithms.lock().unwrap()[node].clone();
                out(0, &format!("{current}\n"), "")
            }
            ["sysctl", "-n", "net.ipv4.tcp_available_congestion_control"] => {
                out(0, &format!("{}\n", self.available().join(" ")), "")
            }
            ["sysctl", "-w", setting] if setting.starts_with("net.ipv4.tcp_congestion_control=") => {
                let algo = setting.trim_start_matches("net.ipv4.tcp_congestion_control=");
                if self.available().iter().any(|a| *a == algo) {
                    self.algorithms
                        .lock()
                        .unwrap()
                        .insert(node.to_string(), algo.to_string());
                    out(0, &format!("{setting}\n"), "")
                } else {
                    out(255, "", "sysctl: setting key \"net.ipv4.tcp_congestion_control\": No such file or directory")
                }
            }
            ["modprobe", ..] => out(1, "", "modprobe: FATAL: Module not found"),
            ["ss", ..] => {
                if self.script.sink_never_ready {
                    out(0, "State Recv-Q Send-Q Local Address:Port Peer Address:Port\n", "")
                } else {
                    out(
                        0,
                        "State Recv-Q Send-Q Local Address:Port Peer Address:Port\n\
                         LISTEN 0 5 0.0.0.0:5201 0.0.0.0:*\n\
                         LISTEN 0 5 0.0.0.0:5001 0.0.0.0:*\n",
                        "",
                    )
                }
            }
            ["iperf3", "-c", ..] | ["iperf", "-c", ..] => {
                events.client_runs += 1;
                if let Some(flag) = &self.script.interrupt {
                    flag.raise();
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "shutdown requested"));
                }
                if events.client_runs <= self.script.connect_failures {
                    out(1, "", "iperf3: error - unable to connect to server: Connection refused")
                } else {
                    out(self.script.traffic_status, &self.script.traffic_output, "")
                }
            }
            ["ping", ..] => out(0, &self.script.probe_output, ""),
            ["tshark", ..] => out(0, &self.script.query_output, ""),
            _ => out(0, "", ""),
        };
        Ok(output)
    }

    fn spawn(&self, node: &str, argv: &[String]) -> io::Result<Box<dyn Background>> {
        let mut events = self.events.lock().unwrap();
        events.spawned.push(format!("{node}: {}", argv.join(" ")));
        Ok(Box::new(FakeProcess {
            alive: true,
            events: Arc::clone(&self.events),
        }))
    }

    fn teardown(&mut self) -> Result<(), ProvisionError> {
        let mut events = self.events.lock().unwrap();
        events.teardowns += 1;
        events.live = events.live.saturating_sub(1);
        Ok(())
    }
}

pub struct FakeProcess {
    alive: bool,
    events: Arc<Mutex<Events>>,
}

impl Background for FakeProcess {
    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn stop(&mut self) -> String {
        if self.alive {
            self.alive = false;
            self.events.lock().unwrap().stopped += 1;
        }
        String::new()
    }
}

/// Fast settings for scripted runs, writing into `dir`.
pub fn test_config(dir: &Path, algorithms: &[&str], protocols: &[&str], repetitions: u32) -> ExperimentConfig {
    let mut config = ExperimentConfig::default()
        .with_overrides(ccmatrix::config::Overrides {
            output_dir: Some(dir.to_path_buf()),
            repetitions: Some(repetitions),
            algorithms: Some(algorithms.iter().map(|s| s.to_string()).collect()),
            protocols: Some(protocols.iter().map(|s| s.to_string()).collect()),
        })
        .unwrap();
    config.traffic.duration = Duration::from_secs(1);
    config.traffic.settle_delay = Duration::ZERO;
    config.traffic.ready_timeout = Duration::from_millis(40);
    config.traffic.ready_poll = Duration::from_millis(5);
    config.traffic.retry_backoff = Duration::from_millis(1);
    config.traffic.sample_local_cpu = false;
    config
}
