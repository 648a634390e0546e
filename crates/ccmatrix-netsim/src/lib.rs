//! Network emulation testbed built on Linux network namespaces.
//!
//! Every topology node is a namespace, every link a veth pair shaped with
//! `tc netem` on both ends. Switch nodes hold a Linux bridge, router nodes
//! forward between their interfaces. Commands run inside a node with a hard
//! wall-clock ceiling, and background processes are killed when their handle
//! is dropped.
//!
//! # Modules
//!
//! - [`command`]: privilege-aware command construction and bounded execution
//! - [`topology`]: namespace and veth link management (RAII cleanup on drop)
//! - [`impairment`]: `tc netem` rate / delay / loss configuration
//! - [`process`]: detached processes inside a namespace
//! - [`network`]: declarative topology specs and the provisioned [`Network`]
//! - [`test_util`]: privilege checks and unique name generation

pub mod command;
pub mod impairment;
pub mod network;
pub mod process;
pub mod test_util;
pub mod topology;

pub use command::CommandOutput;
pub use impairment::{apply_impairment, LinkImpairment};
pub use network::{
    Endpoint, IpVersion, LinkSpec, Network, NodeRole, NodeSpec, RouteSpec, TopologySpec,
};
pub use process::NamespaceProcess;
pub use test_util::{check_binary, check_privileges, unique_ns_name};
pub use topology::Namespace;
