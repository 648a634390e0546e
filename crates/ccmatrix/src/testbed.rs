//! The seam between the engine and the emulation testbed.
//!
//! The controller only ever sees these traits; `NetnsTestbed` backs them with
//! Linux network namespaces, integration tests back them with a script.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use ccmatrix_netsim::network::is_exhaustion;
use ccmatrix_netsim::{CommandOutput, NamespaceProcess, Network, TopologySpec};
use tracing::{debug, warn};

use crate::error::ProvisionError;

/// Creates topologies.
pub trait Testbed {
    fn provision(&self, spec: &TopologySpec) -> Result<Box<dyn Topology>, ProvisionError>;
}

/// A provisioned topology handle.
pub trait Topology {
    fn spec(&self) -> &TopologySpec;

    /// Run `argv` on `node` to completion or until `timeout` expires
    /// (`ErrorKind::TimedOut`). A raised shutdown flag yields
    /// `ErrorKind::Interrupted`.
    fn exec(&self, node: &str, argv: &[String], timeout: Duration) -> io::Result<CommandOutput>;

    /// Start `argv` on `node` in the background.
    fn spawn(&self, node: &str, argv: &[String]) -> io::Result<Box<dyn Background>>;

    /// Release everything the topology holds. Idempotent.
    fn teardown(&mut self) -> Result<(), ProvisionError>;
}

/// A detached process on a node.
pub trait Background {
    fn is_alive(&mut self) -> bool;

    /// Terminate the process and return its combined output.
    fn stop(&mut self) -> String;
}

impl Background for NamespaceProcess {
    fn is_alive(&mut self) -> bool {
        NamespaceProcess::is_alive(self)
    }

    fn stop(&mut self) -> String {
        NamespaceProcess::stop(self)
    }
}

/// Owns a topology for one cell (or one run) and tears it down exactly once,
/// either explicitly or on drop.
pub struct TopologyGuard {
    topology: Box<dyn Topology>,
    released: bool,
}

impl TopologyGuard {
    pub fn new(topology: Box<dyn Topology>) -> Self {
        Self {
            topology,
            released: false,
        }
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn teardown(mut self) -> Result<(), ProvisionError> {
        self.released = true;
        self.topology.teardown()
    }
}

impl Drop for TopologyGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.topology.teardown() {
            warn!(error = %e, "teardown on drop failed");
        }
    }
}

// ── Namespace-backed testbed ────────────────────────────────────────

/// Provisions each topology as a set of network namespaces on this host.
pub struct NetnsTestbed {
    cancel: Arc<AtomicBool>,
}

impl NetnsTestbed {
    /// `cancel` is the process-wide shutdown flag; commands run inside the
    /// topology abort once it is raised.
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel }
    }
}

impl Testbed for NetnsTestbed {
    fn provision(&self, spec: &TopologySpec) -> Result<Box<dyn Topology>, ProvisionError> {
        debug!(nodes = spec.nodes.len(), links = spec.links.len(), "provisioning topology");
        match Network::provision(spec.clone(), Some(Arc::clone(&self.cancel))) {
            Ok(network) => Ok(Box::new(network)),
            Err(e) if is_exhaustion(&e) => Err(ProvisionError::Exhausted(format!("{e:#}"))),
            Err(e) => Err(ProvisionError::Failed(format!("{e:#}"))),
        }
    }
}

impl Topology for Network {
    fn spec(&self) -> &TopologySpec {
        Network::spec(self)
    }

    fn exec(&self, node: &str, argv: &[String], timeout: Duration) -> io::Result<CommandOutput> {
        Network::exec(self, node, argv, timeout)
    }

    fn spawn(&self, node: &str, argv: &[String]) -> io::Result<Box<dyn Background>> {
        let process = Network::spawn(self, node, argv)?;
        Ok(Box::new(process))
    }

    fn teardown(&mut self) -> Result<(), ProvisionError> {
        Network::teardown(self).map_err(|e| ProvisionError::Teardown(e.to_string()))
    }
}
