use std::io;
use std::process::{Command, Output};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::command::{privileged, run_bounded, CommandOutput};

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Supports executing commands inside
/// the namespace and creating veth links to other namespaces.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    deleted: bool,
}

fn check(output: Output, what: &str) -> io::Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(io::Error::other(format!(
            "Failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl Namespace {
    pub fn new(name: &str) -> io::Result<Self> {
        // cleanup any existing namespace with the same name
        let _ = privileged("ip").args(["netns", "del", name]).output();

        check(
            privileged("ip").args(["netns", "add", name]).output()?,
            &format!("create netns {name}"),
        )?;

        let ns = Self {
            name: name.to_string(),
            deleted: false,
        };
        ns.exec("ip", &["link", "set", "lo", "up"])?;
        Ok(ns)
    }

    /// Command that runs `cmd` inside this namespace.
    pub fn command(&self, cmd: &str) -> Command {
        let mut command = privileged("ip");
        command.args(["netns", "exec", &self.name, cmd]);
        command
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        self.command(cmd).args(args).output()
    }

    /// Like [`exec`](Self::exec) but fails on a non-zero exit status.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        let output = self.exec(cmd, args)?;
        check(output, &format!("run `{cmd} {}` in {}", args.join(" "), self.name))
    }

    /// Run `argv` inside the namespace under a wall-clock ceiling.
    pub fn exec_bounded(
        &self,
        argv: &[String],
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> io::Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let mut command = self.command(program);
        command.args(args);
        run_bounded(command, timeout, cancel)
    }

    /// Create a veth pair between `self` and `other`.
    ///
    /// The pair is created in the host namespace under the temporary names
    /// `tmp_local`/`tmp_peer` (which must be unique on the host), moved into
    /// the two namespaces, renamed to `local`/`peer` and brought up.
    pub fn add_veth_link(
        &self,
        other: &Namespace,
        tmp_local: &str,
        tmp_peer: &str,
        local: &str,
        peer: &str,
    ) -> io::Result<()> {
        // Clean up potential leftovers in host
        let _ = privileged("ip").args(["link", "del", tmp_local]).output();

        check(
            privileged("ip")
                .args([
                    "link", "add", tmp_local, "type", "veth", "peer", "name", tmp_peer,
                ])
                .output()?,
            "create veth pair",
        )?;

        check(
            privileged("ip")
                .args(["link", "set", tmp_local, "netns", &self.name])
                .output()?,
            "move local veth",
        )?;
        check(
            privileged("ip")
                .args(["link", "set", tmp_peer, "netns", &other.name])
                .output()?,
            "move peer veth",
        )?;

        for (ns, tmp, name) in [(self, tmp_local, local), (other, tmp_peer, peer)] {
            ns.exec_checked("ip", &["link", "set", tmp, "name", name])?;
            ns.exec_checked("ip", &["link", "set", name, "up"])?;
        }
        Ok(())
    }

    /// Add an address in CIDR notation to `interface`.
    ///
    /// IPv6 addresses skip duplicate address detection so they are usable
    /// immediately. An address that is already present is not an error.
    pub fn add_address(&self, interface: &str, cidr: &str, ipv6: bool) -> io::Result<()> {
        let output = if ipv6 {
            self.exec(
                "ip",
                &["-6", "addr", "add", cidr, "dev", interface, "nodad"],
            )?
        } else {
            self.exec("ip", &["addr", "add", cidr, "dev", interface])?
        };
        if output.status.success() || already_exists(&output) {
            return Ok(());
        }
        check(output, &format!("add {cidr} to {interface}")).map(|_| ())
    }

    /// Add a static route. A route that is already present is not an error.
    pub fn add_route(&self, destination: &str, via: &str, ipv6: bool) -> io::Result<()> {
        let family = if ipv6 { "-6" } else { "-4" };
        let output = self.exec("ip", &[family, "route", "add", destination, "via", via])?;
        if output.status.success() || already_exists(&output) {
            return Ok(());
        }
        check(output, &format!("add route {destination} via {via}")).map(|_| ())
    }

    /// Create a bridge named `bridge` and enslave `ports` to it.
    pub fn add_bridge(&self, bridge: &str, ports: &[&str]) -> io::Result<()> {
        self.exec_checked("ip", &["link", "add", bridge, "type", "bridge"])?;
        self.exec_checked("ip", &["link", "set", bridge, "up"])?;
        for port in ports {
            self.exec_checked("ip", &["link", "set", port, "master", bridge])?;
        }
        Ok(())
    }

    /// PIDs of every process still running inside this namespace.
    pub fn pids(&self) -> io::Result<Vec<u32>> {
        let output = check(
            privileged("ip").args(["netns", "pids", &self.name]).output()?,
            &format!("list pids in {}", self.name),
        )?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect())
    }

    /// SIGKILL every process left inside the namespace.
    ///
    /// Deleting a namespace does not stop the processes in it, so this must
    /// run before [`delete`](Self::delete) for a teardown to be complete.
    pub fn kill_all(&self) -> io::Result<usize> {
        let pids = self.pids()?;
        for pid in &pids {
            let _ = privileged("kill")
                .args(["-9", &pid.to_string()])
                .output();
        }
        Ok(pids.len())
    }

    /// Delete the namespace. Safe to call more than once.
    pub fn delete(&mut self) -> io::Result<()> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        let output = privileged("ip").args(["netns", "del", &self.name]).output()?;
        check(output, &format!("delete netns {}", self.name)).map(|_| ())
    }
}

fn already_exists(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("File exists")
}

impl Drop for Namespace {
    fn drop(&mut self) {
        if !self.deleted {
            let _ = privileged("ip")
                .args(["netns", "del", &self.name])
                .status();
        }
    }
}
