//! Per-node OS configuration: congestion control, addresses, forwarding,
//! routes.

use std::time::Duration;

use ccmatrix_netsim::{CommandOutput, IpVersion, RouteSpec};
use tracing::{debug, info, warn};

use crate::descriptor::RunDescriptor;
use crate::error::ConfigureError;
use crate::testbed::Topology;

const CC_KEY: &str = "net.ipv4.tcp_congestion_control";
const CC_AVAILABLE_KEY: &str = "net.ipv4.tcp_available_congestion_control";

/// Settings changed during a cell, so they can be put back.
#[derive(Debug, Default)]
pub struct AppliedSettings {
    prior_algorithms: Vec<(String, String)>,
}

impl AppliedSettings {
    /// Remember `prior` for `node` unless something is already recorded.
    fn record_prior(&mut self, node: &str, prior: String) {
        if !self.prior_algorithms.iter().any(|(n, _)| n == node) {
            self.prior_algorithms.push((node.to_string(), prior));
        }
    }

    pub fn prior_algorithm(&self, node: &str) -> Option<&str> {
        self.prior_algorithms
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, a)| a.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.prior_algorithms.is_empty()
    }
}

pub struct Driver<'a> {
    topology: &'a dyn Topology,
    timeout: Duration,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl<'a> Driver<'a> {
    pub fn new(topology: &'a dyn Topology, timeout: Duration) -> Self {
        Self { topology, timeout }
    }

    fn run(&self, node: &str, parts: &[&str], what: &str) -> Result<CommandOutput, ConfigureError> {
        self.topology
            .exec(node, &argv(parts), self.timeout)
            .map_err(|e| ConfigureError::Command {
                node: node.to_string(),
                what: what.to_string(),
                detail: e.to_string(),
            })
    }

    fn run_checked(&self, node: &str, parts: &[&str], what: &str) -> Result<CommandOutput, ConfigureError> {
        let out = self.run(node, parts, what)?;
        if !out.success() {
            return Err(ConfigureError::Command {
                node: node.to_string(),
                what: what.to_string(),
                detail: out.combined().trim().to_string(),
            });
        }
        Ok(out)
    }

    fn read_sysctl(&self, node: &str, key: &str) -> Result<String, ConfigureError> {
        let out = self.run_checked(node, &["sysctl", "-n", key], key)?;
        Ok(out.stdout.trim().to_string())
    }

    fn available_algorithms(&self, node: &str) -> Result<Vec<String>, ConfigureError> {
        let list = self.read_sysctl(node, CC_AVAILABLE_KEY)?;
        Ok(list.split_whitespace().map(str::to_string).collect())
    }

    /// Select `algorithm` on `node` and confirm by reading it back.
    ///
    /// Returns the algorithm that was active before. An algorithm the kernel
    /// cannot provide is an error; nothing else is substituted.
    pub fn set_congestion_control(&self, node: &str, algorithm: &str) -> Result<String, ConfigureError> {
        let prior = self.read_sysctl(node, CC_KEY)?;

        let mut available = self.available_algorithms(node)?;
        if !available.iter().any(|a| a == algorithm) {
            let module = format!("tcp_{algorithm}");
            debug!(node, module = %module, "algorithm not loaded, trying modprobe");
            let loaded = self.run(node, &["modprobe", &module], "modprobe")?;
            if !loaded.success() {
                debug!(node, module = %module, output = %loaded.combined().trim(), "modprobe failed");
            }
            available = self.available_algorithms(node)?;
            if !available.iter().any(|a| a == algorithm) {
                return Err(ConfigureError::Unsupported {
                    node: node.to_string(),
                    algorithm: algorithm.to_string(),
                    available: available.join(" "),
                });
            }
        }

        let assignment = format!("{CC_KEY}={algorithm}");
        let out = self.run(node, &["sysctl", "-w", &assignment], CC_KEY)?;
        if !out.success() {
            return Err(ConfigureError::Unsupported {
                node: node.to_string(),
                algorithm: algorithm.to_string(),
                available: available.join(" "),
            });
        }

        let actual = self.read_sysctl(node, CC_KEY)?;
        if actual != algorithm {
            return Err(ConfigureError::NotApplied {
                node: node.to_string(),
                expected: algorithm.to_string(),
                actual,
            });
        }
        debug!(node, algorithm, prior = %prior, "congestion control set");
        Ok(prior)
    }

    /// Add `cidr` to the interface of `node` that the topology assigns it to,
    /// or to the node's first interface. An address that is already present
    /// counts as success.
    pub fn assign_protocol_address(&self, node: &str, version: IpVersion, cidr: &str) -> Result<(), ConfigureError> {
        let spec = self.topology.spec();
        let interface = spec
            .endpoints(node)
            .find(|e| e.address(version) == Some(cidr))
            .map(|e| e.interface.clone())
            .or_else(|| spec.interface(node).map(str::to_string))
            .ok_or_else(|| ConfigureError::Command {
                node: node.to_string(),
                what: "address assignment".into(),
                detail: "node has no interface".into(),
            })?;

        let family = if version.is_v6() { "-6" } else { "-4" };
        let mut parts = vec!["ip", family, "addr", "add", cidr, "dev", interface.as_str()];
        if version.is_v6() {
            parts.push("nodad");
        }
        let out = self.run(node, &parts, "ip addr add")?;
        if out.success() || out.stderr.contains("File exists") {
            return Ok(());
        }
        Err(ConfigureError::Command {
            node: node.to_string(),
            what: format!("ip addr add {cidr}"),
            detail: out.combined().trim().to_string(),
        })
    }

    pub fn enable_forwarding(&self, node: &str) -> Result<(), ConfigureError> {
        self.run_checked(node, &["sysctl", "-w", "net.ipv4.ip_forward=1"], "ipv4 forwarding")?;
        self.run_checked(
            node,
            &["sysctl", "-w", "net.ipv6.conf.all.forwarding=1"],
            "ipv6 forwarding",
        )?;
        Ok(())
    }

    /// Install `route`, replacing any route to the same destination.
    pub fn add_route(&self, route: &RouteSpec) -> Result<(), ConfigureError> {
        let family = if route.version.is_v6() { "-6" } else { "-4" };
        self.run_checked(
            &route.node,
            &["ip", family, "route", "replace", &route.destination, "via", &route.via],
            "ip route replace",
        )?;
        Ok(())
    }

    /// Apply everything a cell needs: the algorithm on every host, and for
    /// the cell's protocol the remaining addresses, forwarding and routes.
    pub fn configure(&self, descriptor: &RunDescriptor, applied: &mut AppliedSettings) -> Result<(), ConfigureError> {
        let spec = self.topology.spec();
        let protocol = descriptor.protocol;

        for host in spec.hosts() {
            let prior = self.set_congestion_control(&host.name, &descriptor.algorithm)?;
            applied.record_prior(&host.name, prior);
        }

        // IPv4 addresses are assigned when the topology is provisioned.
        if protocol.is_v6() {
            for endpoint in spec.links.iter().flat_map(|l| [&l.a, &l.b]) {
                if let Some(cidr) = endpoint.address(protocol) {
                    self.assign_protocol_address(&endpoint.node, protocol, cidr)?;
                }
            }
        }

        for router in spec.routers() {
            self.enable_forwarding(&router.name)?;
        }
        for route in spec.routes_for(protocol) {
            self.add_route(route)?;
        }

        info!(
            algorithm = %descriptor.algorithm,
            protocol = %protocol,
            hosts = spec.hosts().count(),
            "cell configured"
        );
        Ok(())
    }

    /// Put back every algorithm recorded in `applied`. Keeps going past
    /// failures and reports the first one.
    pub fn restore(&self, applied: &mut AppliedSettings) -> Result<(), ConfigureError> {
        let mut first_err = None;
        for (node, prior) in applied.prior_algorithms.drain(..) {
            let assignment = format!("{CC_KEY}={prior}");
            if let Err(e) = self.run_checked(&node, &["sysctl", "-w", &assignment], CC_KEY) {
                warn!(node = %node, error = %e, "could not restore congestion control");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
