//! Detached processes inside a namespace.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::command::{drain, join, kill_group, signal_group};
use crate::topology::Namespace;

/// How long a process gets to exit after SIGTERM before it is SIGKILLed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// A child process running inside a network namespace.
///
/// Captures stdout+stderr and kills the process on drop.
pub struct NamespaceProcess {
    child: Option<Child>,
    label: String,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl NamespaceProcess {
    /// Spawn `argv` inside `ns` via `ip netns exec`, as its own process group.
    pub fn spawn(ns: &Namespace, argv: &[String]) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        let label = format!("{} in ns:{}", argv.join(" "), ns.name);

        let mut child = ns
            .command(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        tracing::debug!(%label, pid = child.id(), "spawned namespace process");
        Ok(Self {
            child: Some(child),
            label,
            stdout,
            stderr,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    /// Send SIGTERM, wait up to two seconds, then SIGKILL if needed.
    ///
    /// Returns everything the process wrote to stdout and stderr. Calling
    /// `stop` again returns an empty string.
    pub fn stop(&mut self) -> String {
        let Some(mut child) = self.child.take() else {
            return String::new();
        };

        if child.try_wait().ok().flatten().is_none() {
            signal_group(child.id(), libc::SIGTERM);
            let deadline = Instant::now() + TERM_GRACE;
            while child.try_wait().ok().flatten().is_none() {
                if Instant::now() >= deadline {
                    tracing::warn!(label = %self.label, "process ignored SIGTERM, killing");
                    kill_group(&mut child);
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        let _ = child.wait();

        let stdout = join(self.stdout.take());
        let stderr = join(self.stderr.take());
        tracing::debug!(label = %self.label, "namespace process stopped");
        if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}{stderr}")
        }
    }
}

impl Drop for NamespaceProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop();
        }
    }
}
