#![forbid(unsafe_code)]

use crate::shutdown::ShutdownToken;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(50);
const OUTPUT_TRUNCATED_MARKER: &str = "\n[output truncated]";

#[derive(Clone, Debug)]
pub struct ExecParams {
    /// Wall-clock budget for one attempt.
    pub timeout: Duration,
    /// How long a terminated child gets between SIGTERM and SIGKILL.
    pub term_grace: Duration,
    /// How long a running job may continue after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Byte cap on the captured combined output.
    pub output_limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Exit,
    Timeout,
    Spawn,
    Signal,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Exit => "exit",
            FailureReason::Timeout => "timeout",
            FailureReason::Spawn => "spawn",
            FailureReason::Signal => "signal",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExecOutcome {
    Success {
        output: String,
    },
    Failure {
        exit_code: Option<i32>,
        output: String,
        reason: FailureReason,
        message: String,
    },
    /// Shutdown grace ran out mid-job. The caller reports nothing to the
    /// store; the abandoned lease expires like a crashed worker's would.
    Cancelled,
}

/// Child that is killed and reaped on every exit path, including panics in
/// the caller.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(unix)]
fn signal_child(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = kill(Pid::from_raw(pid as i32), signal);
}

#[cfg(not(unix))]
fn signal_child(_pid: u32, _force: bool) {}

/// Drain a pipe to EOF, keeping at most `limit` bytes. Draining past the cap
/// keeps the child from blocking on a full pipe buffer.
fn capture_stream(mut reader: impl Read, limit: usize) -> (Vec<u8>, bool) {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < limit {
                    let take = n.min(limit - captured.len());
                    captured.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (captured, truncated)
}

fn combine_output(
    stdout: (Vec<u8>, bool),
    stderr: (Vec<u8>, bool),
    limit: usize,
) -> String {
    let mut bytes = stdout.0;
    bytes.extend_from_slice(&stderr.0);
    let mut truncated = stdout.1 || stderr.1;
    if bytes.len() > limit {
        bytes.truncate(limit);
        truncated = true;
    }
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str(OUTPUT_TRUNCATED_MARKER);
    }
    text
}

#[cfg(unix)]
fn signal_number(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_number(_status: ExitStatus) -> Option<i32> {
    None
}

fn outcome_from_status(status: ExitStatus, output: String) -> ExecOutcome {
    match status.code() {
        Some(0) => ExecOutcome::Success { output },
        Some(code) => ExecOutcome::Failure {
            exit_code: Some(code),
            output,
            reason: FailureReason::Exit,
            message: format!("exit code {code}"),
        },
        None => {
            let message = match signal_number(status) {
                Some(sig) => format!("terminated by signal {sig}"),
                None => "terminated by signal".to_string(),
            };
            ExecOutcome::Failure {
                exit_code: None,
                output,
                reason: FailureReason::Signal,
                message,
            }
        }
    }
}

/// Run `command` through the shell so the user's quoting and pipes keep their
/// meaning, bounded by `params.timeout`. `on_tick` fires every poll slice;
/// the worker uses it to heartbeat its lease.
pub fn run(
    command: &str,
    params: &ExecParams,
    shutdown: &ShutdownToken,
    on_tick: &mut dyn FnMut(),
) -> ExecOutcome {
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let child = match spawned {
        Ok(child) => child,
        Err(err) => {
            return ExecOutcome::Failure {
                exit_code: None,
                output: String::new(),
                reason: FailureReason::Spawn,
                message: format!("failed to spawn shell: {err}"),
            };
        }
    };
    let mut guard = ChildGuard {
        child,
        reaped: false,
    };

    let limit = params.output_limit;
    let stdout = guard.child.stdout.take();
    let stderr = guard.child.stderr.take();
    let stdout_reader = std::thread::spawn(move || match stdout {
        Some(pipe) => capture_stream(pipe, limit),
        None => (Vec::new(), false),
    });
    let stderr_reader = std::thread::spawn(move || match stderr {
        Some(pipe) => capture_stream(pipe, limit),
        None => (Vec::new(), false),
    });
    let collect_output = |stdout_reader: std::thread::JoinHandle<(Vec<u8>, bool)>,
                          stderr_reader: std::thread::JoinHandle<(Vec<u8>, bool)>| {
        let out = stdout_reader.join().unwrap_or((Vec::new(), false));
        let err = stderr_reader.join().unwrap_or((Vec::new(), false));
        combine_output(out, err, limit)
    };

    let started = Instant::now();
    let deadline = started + params.timeout;
    let mut cancel_deadline: Option<Instant> = None;

    loop {
        match guard.child.try_wait() {
            Ok(Some(status)) => {
                guard.reaped = true;
                let output = collect_output(stdout_reader, stderr_reader);
                return outcome_from_status(status, output);
            }
            Ok(None) => {}
            Err(err) => {
                signal_child(guard.pid(), true);
                let _ = guard.child.wait();
                guard.reaped = true;
                let output = collect_output(stdout_reader, stderr_reader);
                return ExecOutcome::Failure {
                    exit_code: None,
                    output,
                    reason: FailureReason::Spawn,
                    message: format!("wait failed: {err}"),
                };
            }
        }

        on_tick();

        let now = Instant::now();
        if shutdown.requested() && cancel_deadline.is_none() {
            cancel_deadline = Some(now + params.shutdown_grace);
        }
        if let Some(cancel_at) = cancel_deadline {
            if now >= cancel_at {
                terminate(&mut guard, params.term_grace);
                let _ = collect_output(stdout_reader, stderr_reader);
                return ExecOutcome::Cancelled;
            }
        }
        if now >= deadline {
            terminate(&mut guard, params.term_grace);
            let output = collect_output(stdout_reader, stderr_reader);
            return ExecOutcome::Failure {
                exit_code: None,
                output,
                reason: FailureReason::Timeout,
                message: format!("timed out after {}s", params.timeout.as_secs()),
            };
        }

        std::thread::sleep(POLL_SLICE);
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL; always reaps.
fn terminate(guard: &mut ChildGuard, term_grace: Duration) {
    signal_child(guard.pid(), false);
    let grace_deadline = Instant::now() + term_grace;
    while Instant::now() < grace_deadline {
        match guard.child.try_wait() {
            Ok(Some(_)) => {
                guard.reaped = true;
                return;
            }
            Ok(None) => std::thread::sleep(POLL_SLICE),
            Err(_) => break,
        }
    }
    signal_child(guard.pid(), true);
    let _ = guard.child.wait();
    guard.reaped = true;
}
