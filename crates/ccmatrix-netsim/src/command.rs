//! Command construction and bounded execution.
//!
//! External tools are never trusted to return on their own: every call made
//! through [`run_bounded`] has a hard wall-clock ceiling, after which the
//! whole process group is killed and `io::ErrorKind::TimedOut` is returned.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the current process runs with an effective uid of 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid(2) has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Build a command for `program` that runs with root privileges.
///
/// As root the program is executed directly; otherwise it is wrapped in a
/// non-interactive `sudo -n` so a missing sudoers entry fails fast instead
/// of blocking on a password prompt.
pub fn privileged(program: &str) -> Command {
    if is_root() {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.args(["-n", program]);
        cmd
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Drain a child pipe on a helper thread so a chatty tool can never block
/// on a full pipe buffer while we wait for it.
pub(crate) fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

pub(crate) fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Children are spawned as group leaders, so this reaches the inner tool
/// even when it is wrapped by `sudo` or `ip netns exec`.
pub fn signal_group(pid: u32, signal: i32) {
    if is_root() {
        // SAFETY: a negative pid addresses the process group created by
        // `process_group(0)` at spawn time. A stale group yields ESRCH,
        // which is harmless and ignored.
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    } else {
        let _ = Command::new("sudo")
            .args(["-n", "kill", &format!("-{signal}"), "--", &format!("-{pid}")])
            .stdin(Stdio::null())
            .output();
    }
}

pub(crate) fn kill_group(child: &mut Child) {
    signal_group(child.id(), libc::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

/// Run `cmd` to completion, killing it once `timeout` elapses or `cancel`
/// is raised.
///
/// Returns `TimedOut` on ceiling expiry and `Interrupted` on cancellation.
/// A non-zero exit status is not an error; callers inspect
/// [`CommandOutput::status`].
pub fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> io::Result<CommandOutput> {
    let label = format!("{cmd:?}");
    let started = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = started + timeout;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            kill_group(&mut child);
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("{label} interrupted by shutdown"),
            ));
        }
        if Instant::now() >= deadline {
            kill_group(&mut child);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{label} exceeded its {}s ceiling", timeout.as_secs_f64()),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    };

    tracing::trace!(command = %label, status = ?status.code(), "command finished");

    Ok(CommandOutput {
        status: status.code(),
        stdout: join(stdout),
        stderr: join(stderr),
        elapsed: started.elapsed(),
    })
}
