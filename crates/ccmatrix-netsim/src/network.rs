//! Declarative topology specs and their provisioned form.
//!
//! A [`TopologySpec`] lists nodes, links with their impairment, per-endpoint
//! addresses and static routes. [`Network::provision`] turns it into
//! namespaces, veth pairs, bridges and netem qdiscs, and assigns the IPv4
//! addresses. IPv6 addresses, forwarding and routes are left to the caller so
//! they can be applied per protocol.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::command::CommandOutput;
use crate::impairment::{apply_impairment, LinkImpairment};
use crate::process::NamespaceProcess;
use crate::test_util::unique_ns_name;
use crate::topology::Namespace;

/// Linux netdev name limit.
const IFNAMSIZ: usize = 15;
const BRIDGE_NAME: &str = "br0";

/// Error fragments that mean the host itself ran out of a resource.
const EXHAUSTION_MARKERS: &[&str] = &[
    "No space left on device",
    "Cannot allocate memory",
    "Too many open files",
    "No buffer space available",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    /// Human label, `IPv4` / `IPv6`.
    pub fn label(self) -> &'static str {
        match self {
            IpVersion::V4 => "IPv4",
            IpVersion::V6 => "IPv6",
        }
    }

    /// Lowercase key used in file names, `ipv4` / `ipv6`.
    pub fn key(self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4",
            IpVersion::V6 => "ipv6",
        }
    }

    pub fn is_v6(self) -> bool {
        self == IpVersion::V6
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for IpVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" | "inet" => Ok(IpVersion::V4),
            "ipv6" | "v6" | "6" | "inet6" => Ok(IpVersion::V6),
            other => Err(format!("unknown IP version `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Host,
    Switch,
    Router,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub role: NodeRole,
}

/// One side of a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
    /// IPv4 address in CIDR notation, e.g. `10.0.1.2/24`.
    pub ipv4: Option<String>,
    /// IPv6 address in CIDR notation, e.g. `2001:db8:0:1::2/64`.
    pub ipv6: Option<String>,
}

impl Endpoint {
    fn bare(node: &str, interface: &str) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
            ipv4: None,
            ipv6: None,
        }
    }

    fn addressed(node: &str, interface: &str, ipv4: &str, ipv6: &str) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
            ipv4: Some(ipv4.into()),
            ipv6: Some(ipv6.into()),
        }
    }

    pub fn address(&self, version: IpVersion) -> Option<&str> {
        match version {
            IpVersion::V4 => self.ipv4.as_deref(),
            IpVersion::V6 => self.ipv6.as_deref(),
        }
    }
}

/// A point-to-point link. The impairment is applied on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
    pub impairment: LinkImpairment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub node: String,
    pub version: IpVersion,
    /// Destination prefix or `default`.
    pub destination: String,
    pub via: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
    pub routes: Vec<RouteSpec>,
    /// Host that sends traffic.
    pub source: String,
    /// Host that receives traffic.
    pub sink: String,
}

fn node(name: &str, role: NodeRole) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        role,
    }
}

fn route(node: &str, version: IpVersion, destination: &str, via: &str) -> RouteSpec {
    RouteSpec {
        node: node.into(),
        version,
        destination: destination.into(),
        via: via.into(),
    }
}

impl TopologySpec {
    /// `h1 -- s1 -- s2 -- h2` with every link impaired and both hosts on one
    /// subnet.
    pub fn switched(link: LinkImpairment) -> Self {
        Self {
            nodes: vec![
                node("h1", NodeRole::Host),
                node("h2", NodeRole::Host),
                node("s1", NodeRole::Switch),
                node("s2", NodeRole::Switch),
            ],
            links: vec![
                LinkSpec {
                    a: Endpoint::addressed("h1", "h1-eth0", "10.0.0.1/24", "2001:db8::1/64"),
                    b: Endpoint::bare("s1", "s1-eth1"),
                    impairment: link,
                },
                LinkSpec {
                    a: Endpoint::addressed("h2", "h2-eth0", "10.0.0.2/24", "2001:db8::2/64"),
                    b: Endpoint::bare("s2", "s2-eth1"),
                    impairment: link,
                },
                LinkSpec {
                    a: Endpoint::bare("s1", "s1-eth2"),
                    b: Endpoint::bare("s2", "s2-eth2"),
                    impairment: link,
                },
            ],
            routes: Vec::new(),
            source: "h1".into(),
            sink: "h2".into(),
        }
    }

    /// `h1 -- r1 -- r2 -- h2`: hosts on their own subnets, `access` impairment
    /// on the host links and `transit` on the router-to-router link.
    pub fn routed(access: LinkImpairment, transit: LinkImpairment) -> Self {
        use IpVersion::{V4, V6};
        Self {
            nodes: vec![
                node("r1", NodeRole::Router),
                node("r2", NodeRole::Router),
                node("h1", NodeRole::Host),
                node("h2", NodeRole::Host),
            ],
            links: vec![
                LinkSpec {
                    a: Endpoint::addressed("h1", "h1-eth0", "10.0.1.2/24", "2001:db8:0:1::2/64"),
                    b: Endpoint::addressed("r1", "r1-eth0", "10.0.1.1/24", "2001:db8:0:1::1/64"),
                    impairment: access,
                },
                LinkSpec {
                    a: Endpoint::addressed("h2", "h2-eth0", "10.0.2.2/24", "2001:db8:0:2::2/64"),
                    b: Endpoint::addressed("r2", "r2-eth0", "10.0.2.1/24", "2001:db8:0:2::1/64"),
                    impairment: access,
                },
                LinkSpec {
                    a: Endpoint::addressed("r1", "r1-eth1", "192.168.1.1/30", "2001:db8:1::1/64"),
                    b: Endpoint::addressed("r2", "r2-eth1", "192.168.1.2/30", "2001:db8:1::2/64"),
                    impairment: transit,
                },
            ],
            routes: vec![
                route("h1", V4, "default", "10.0.1.1"),
                route("h2", V4, "default", "10.0.2.1"),
                route("r1", V4, "10.0.2.0/24", "192.168.1.2"),
                route("r2", V4, "10.0.1.0/24", "192.168.1.1"),
                route("h1", V6, "default", "2001:db8:0:1::1"),
                route("h2", V6, "default", "2001:db8:0:2::1"),
                route("r1", V6, "2001:db8:0:2::/64", "2001:db8:1::2"),
                route("r2", V6, "2001:db8:0:1::/64", "2001:db8:1::1"),
            ],
            source: "h1".into(),
            sink: "h2".into(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Every link endpoint that belongs to `node`, in link order.
    pub fn endpoints<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a Endpoint> + 'a {
        let node = node.to_owned();
        self.links
            .iter()
            .flat_map(|l| [&l.a, &l.b])
            .filter(move |e| e.node == node)
    }

    /// First interface of `node`; for hosts this is the traffic interface.
    pub fn interface(&self, node: &str) -> Option<&str> {
        self.endpoints(node).next().map(|e| e.interface.as_str())
    }

    /// First address of `node` for `version`, without the prefix length.
    pub fn address(&self, node: &str, version: IpVersion) -> Option<IpAddr> {
        self.endpoints(node)
            .filter_map(|e| e.address(version))
            .find_map(|cidr| cidr.split('/').next()?.parse().ok())
    }

    pub fn routers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Router)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Host)
    }

    pub fn routes_for(&self, version: IpVersion) -> impl Iterator<Item = &RouteSpec> {
        self.routes.iter().filter(move |r| r.version == version)
    }

    pub fn has_router_hop(&self) -> bool {
        self.routers().next().is_some()
    }

    /// Structural checks: unique nodes, known link/route endpoints, hosts as
    /// source and sink, interface names within the kernel limit.
    pub fn validate(&self) -> Result<(), String> {
        for (idx, n) in self.nodes.iter().enumerate() {
            if self.nodes[..idx].iter().any(|m| m.name == n.name) {
                return Err(format!("duplicate node `{}`", n.name));
            }
        }
        for link in &self.links {
            for e in [&link.a, &link.b] {
                if self.node(&e.node).is_none() {
                    return Err(format!("link endpoint references unknown node `{}`", e.node));
                }
                if e.interface.is_empty() || e.interface.len() > IFNAMSIZ {
                    return Err(format!(
                        "interface name `{}` must be 1..={IFNAMSIZ} characters",
                        e.interface
                    ));
                }
            }
            if link.a.node == link.b.node {
                return Err(format!("link loops back onto `{}`", link.a.node));
            }
        }
        for r in &self.routes {
            if self.node(&r.node).is_none() {
                return Err(format!("route references unknown node `{}`", r.node));
            }
        }
        for (what, name) in [("source", &self.source), ("sink", &self.sink)] {
            match self.node(name) {
                Some(n) if n.role == NodeRole::Host => {}
                Some(_) => return Err(format!("{what} `{name}` is not a host")),
                None => return Err(format!("{what} `{name}` is not a node")),
            }
        }
        if self.source == self.sink {
            return Err("source and sink must differ".into());
        }
        Ok(())
    }
}

/// Whether a provisioning error means the host ran out of a resource,
/// rather than this topology being unbuildable.
pub fn is_exhaustion(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string();
        EXHAUSTION_MARKERS.iter().any(|m| msg.contains(m))
    })
}

/// A provisioned topology: one namespace per node.
///
/// Tearing down kills every process left in each namespace and deletes the
/// namespaces. `teardown` is idempotent and also runs on drop, so a
/// partially provisioned network is cleaned up as well.
pub struct Network {
    spec: TopologySpec,
    namespaces: Vec<(String, Namespace)>,
    cancel: Option<Arc<AtomicBool>>,
    torn_down: bool,
}

impl Network {
    pub fn provision(spec: TopologySpec, cancel: Option<Arc<AtomicBool>>) -> Result<Self> {
        if let Err(msg) = spec.validate() {
            bail!("invalid topology: {msg}");
        }

        let prefix = unique_ns_name("ccm");
        let mut net = Network {
            spec,
            namespaces: Vec::new(),
            cancel,
            torn_down: false,
        };

        for node in &net.spec.nodes {
            let ns_name = format!("{prefix}-{}", node.name);
            let ns = Namespace::new(&ns_name)
                .with_context(|| format!("create namespace for node {}", node.name))?;
            net.namespaces.push((node.name.clone(), ns));
        }

        for link in &net.spec.links {
            let a = net.ns(&link.a.node)?;
            let b = net.ns(&link.b.node)?;
            a.add_veth_link(
                b,
                &unique_ns_name("ccv"),
                &unique_ns_name("ccv"),
                &link.a.interface,
                &link.b.interface,
            )
            .with_context(|| format!("link {} <-> {}", link.a.interface, link.b.interface))?;
            apply_impairment(a, &link.a.interface, &link.impairment)
                .with_context(|| format!("impair {}", link.a.interface))?;
            apply_impairment(b, &link.b.interface, &link.impairment)
                .with_context(|| format!("impair {}", link.b.interface))?;
        }

        for node in net.spec.nodes.iter().filter(|n| n.role == NodeRole::Switch) {
            let ports: Vec<&str> = net
                .spec
                .endpoints(&node.name)
                .map(|e| e.interface.as_str())
                .collect();
            net.ns(&node.name)?
                .add_bridge(BRIDGE_NAME, &ports)
                .with_context(|| format!("bridge on switch {}", node.name))?;
        }

        for endpoint in net.spec.links.iter().flat_map(|l| [&l.a, &l.b]) {
            if let Some(cidr) = &endpoint.ipv4 {
                net.ns(&endpoint.node)?
                    .add_address(&endpoint.interface, cidr, false)
                    .with_context(|| format!("address {cidr} on {}", endpoint.interface))?;
            }
        }

        tracing::info!(
            prefix = %prefix,
            nodes = net.namespaces.len(),
            links = net.spec.links.len(),
            "topology provisioned"
        );
        Ok(net)
    }

    fn ns(&self, node: &str) -> Result<&Namespace> {
        self.namespace(node)
            .with_context(|| format!("node `{node}` has no namespace"))
    }

    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    pub fn namespace(&self, node: &str) -> Option<&Namespace> {
        self.namespaces
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, ns)| ns)
    }

    fn namespace_io(&self, node: &str) -> io::Result<&Namespace> {
        if self.torn_down {
            return Err(io::Error::other("network already torn down"));
        }
        self.namespace(node).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown node `{node}`"))
        })
    }

    /// Run `argv` on `node` under `timeout`.
    pub fn exec(&self, node: &str, argv: &[String], timeout: Duration) -> io::Result<CommandOutput> {
        let ns = self.namespace_io(node)?;
        tracing::debug!(node, cmd = %argv.join(" "), "exec");
        ns.exec_bounded(argv, timeout, self.cancel.as_deref())
    }

    /// Start `argv` on `node` in the background.
    pub fn spawn(&self, node: &str, argv: &[String]) -> io::Result<NamespaceProcess> {
        NamespaceProcess::spawn(self.namespace_io(node)?, argv)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Kill leftover processes and delete every namespace. Safe to call
    /// more than once; later calls are no-ops.
    pub fn teardown(&mut self) -> io::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_err = None;
        for (node, ns) in &self.namespaces {
            match ns.kill_all() {
                Ok(0) => {}
                Ok(n) => tracing::debug!(node = %node, killed = n, "killed leftover processes"),
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "failed to list namespace processes");
                }
            }
        }
        for (node, ns) in self.namespaces.iter_mut().rev() {
            if let Err(e) = ns.delete() {
                tracing::warn!(node = %node, error = %e, "failed to delete namespace");
                first_err.get_or_insert(e);
            }
        }
        self.namespaces.clear();

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!("topology torn down");
                Ok(())
            }
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "teardown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_privileges;

    fn lossy(rate: f64, delay: f64, loss: f64) -> LinkImpairment {
        LinkImpairment {
            rate_mbit: Some(rate),
            delay_ms: Some(delay),
            loss_percent: Some(loss),
            netem_limit: None,
        }
    }

    #[test]
    fn presets_validate() {
        let switched = TopologySpec::switched(lossy(100.0, 100.0, 5.0));
        switched.validate().unwrap();
        assert!(!switched.has_router_hop());
        assert_eq!(switched.endpoints("s1").count(), 2);

        let routed = TopologySpec::routed(lossy(100_000.0, 0.0, 0.0), lossy(100_000.0, 100.0, 5.0));
        routed.validate().unwrap();
        assert!(routed.has_router_hop());
        assert_eq!(routed.routers().count(), 2);
        assert_eq!(routed.routes_for(IpVersion::V6).count(), 4);
    }

    #[test]
    fn host_addresses_and_interfaces() {
        let routed = TopologySpec::routed(LinkImpairment::default(), LinkImpairment::default());
        assert_eq!(
            routed.address("h2", IpVersion::V4),
            Some("10.0.2.2".parse().unwrap())
        );
        assert_eq!(
            routed.address("h2", IpVersion::V6),
            Some("2001:db8:0:2::2".parse().unwrap())
        );
        assert_eq!(routed.interface("h1"), Some("h1-eth0"));
        assert_eq!(routed.address("s9", IpVersion::V4), None);
    }

    #[test]
    fn validate_rejects_broken_specs() {
        let mut spec = TopologySpec::switched(LinkImpairment::default());
        spec.sink = "s1".into();
        assert!(spec.validate().unwrap_err().contains("not a host"));

        let mut spec = TopologySpec::switched(LinkImpairment::default());
        spec.links[0].a.interface = "a-very-long-interface".into();
        assert!(spec.validate().is_err());

        let mut spec = TopologySpec::switched(LinkImpairment::default());
        spec.nodes.push(node("h1", NodeRole::Host));
        assert!(spec.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn ip_version_parsing() {
        assert_eq!("IPv4".parse::<IpVersion>().unwrap(), IpVersion::V4);
        assert_eq!("ipv6".parse::<IpVersion>().unwrap(), IpVersion::V6);
        assert!("ipx".parse::<IpVersion>().is_err());
        assert_eq!(IpVersion::V6.to_string(), "IPv6");
        assert_eq!(IpVersion::V6.key(), "ipv6");
    }

    #[test]
    fn exhaustion_is_detected_through_context() {
        let err = anyhow::Error::new(io::Error::other("Failed to create netns: No space left on device"))
            .context("create namespace for node h1");
        assert!(is_exhaustion(&err));
        let err = anyhow::anyhow!("Failed to create veth pair: RTNETLINK answers: File exists");
        assert!(!is_exhaustion(&err));
    }

    #[test]
    fn provision_routed_and_ping_across_routers() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let spec = TopologySpec::routed(LinkImpairment::default(), LinkImpairment::default());
        let mut net = Network::provision(spec, None).expect("provision");
        for r in ["r1", "r2"] {
            net.namespace(r)
                .unwrap()
                .exec_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])
                .unwrap();
        }
        for rt in net.spec().routes_for(IpVersion::V4).cloned().collect::<Vec<_>>() {
            net.namespace(&rt.node)
                .unwrap()
                .add_route(&rt.destination, &rt.via, false)
                .unwrap();
        }

        let argv: Vec<String> = ["ping", "-c", "1", "-W", "2", "10.0.2.2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = net.exec("h1", &argv, Duration::from_secs(10)).unwrap();
        assert!(out.success(), "ping failed: {}", out.combined());

        net.teardown().unwrap();
        net.teardown().unwrap();
        assert!(net.is_torn_down());
        assert!(net.exec("h1", &argv, Duration::from_secs(1)).is_err());
    }
}
