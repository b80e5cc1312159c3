#![forbid(unsafe_code)]

use crate::error::CliError;
use crate::shutdown::ShutdownToken;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

pub(crate) const PID_FILE: &str = "queuectl_workers.pid";

const WAIT_POLL: Duration = Duration::from_millis(200);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub(crate) fn registry_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join(PID_FILE)
}

/// One decimal PID per line; blank lines are tolerated, anything else is a
/// corrupt registry.
pub(crate) fn parse_registry(text: &str) -> Result<Vec<u32>, String> {
    let mut pids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid = line
            .parse::<u32>()
            .map_err(|_| format!("bad PID line '{line}'"))?;
        pids.push(pid);
    }
    Ok(pids)
}

pub(crate) fn read_registry(storage_dir: &Path) -> Vec<u32> {
    let path = registry_path(storage_dir);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match parse_registry(&text) {
        Ok(pids) => pids,
        Err(err) => {
            eprintln!("[supervisor] ignoring corrupt registry {}: {err}", path.display());
            Vec::new()
        }
    }
}

fn write_registry(storage_dir: &Path, pids: &[u32]) -> std::io::Result<()> {
    let mut text = String::new();
    for pid in pids {
        text.push_str(&pid.to_string());
        text.push('\n');
    }
    std::fs::write(registry_path(storage_dir), text)
}

fn remove_registry(storage_dir: &Path) {
    let _ = std::fs::remove_file(registry_path(storage_dir));
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // signal 0 probes existence; EPERM still means the process is there
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) -> nix::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    kill(Pid::from_raw(pid as i32), signal)
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _force: bool) -> Result<(), std::io::Error> {
    Err(std::io::Error::other("process signalling requires unix"))
}

/// Registry PIDs that still point at a live process. A registry with only
/// dead PIDs is removed so stale files from a killed supervisor self-heal.
pub(crate) fn active_workers(storage_dir: &Path) -> Vec<u32> {
    let listed = read_registry(storage_dir);
    let live: Vec<u32> = listed.iter().copied().filter(|pid| pid_alive(*pid)).collect();
    if live.is_empty() && registry_path(storage_dir).exists() {
        remove_registry(storage_dir);
    }
    live
}

/// Prefer a `queuectl_worker` sitting next to this binary so
/// `./target/debug/queuectl worker start` works without PATH setup.
fn worker_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("queuectl_worker");
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("queuectl_worker")
}

/// Spawn `count` workers, record their PIDs, and block until they exit.
/// A shutdown signal is forwarded as SIGTERM; workers that outlive the stop
/// grace get SIGKILL.
pub(crate) fn start(
    storage_dir: &Path,
    count: u32,
    shutdown: &ShutdownToken,
) -> Result<(), CliError> {
    let active = active_workers(storage_dir);
    if !active.is_empty() {
        let pids = active
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("[WARN] Workers already running (PIDs: {pids})");
        println!("  Stop them first with: queuectl worker stop");
        return Ok(());
    }

    let binary = worker_binary();
    let mut children: Vec<Child> = Vec::new();
    for _ in 0..count {
        let spawned = Command::new(&binary)
            .arg("--storage-dir")
            .arg(storage_dir)
            .spawn();
        match spawned {
            Ok(child) => children.push(child),
            Err(err) => {
                // roll back: a partially started pool is worse than none
                for child in &mut children {
                    let _ = signal_pid(child.id(), false);
                }
                for child in &mut children {
                    let _ = child.wait();
                }
                return Err(CliError::Validation(format!(
                    "failed to spawn worker ({}): {err}",
                    binary.display()
                )));
            }
        }
    }

    let pids: Vec<u32> = children.iter().map(Child::id).collect();
    write_registry(storage_dir, &pids)?;
    println!("[OK] {count} worker(s) started. Press Ctrl+C to stop.");

    wait_for_children(&mut children, shutdown);
    remove_registry(storage_dir);
    println!("All workers stopped");
    Ok(())
}

fn wait_for_children(children: &mut Vec<Child>, shutdown: &ShutdownToken) {
    let mut forwarded = false;
    let mut kill_deadline: Option<Instant> = None;

    loop {
        children.retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
        if children.is_empty() {
            return;
        }

        if shutdown.requested() && !forwarded {
            forwarded = true;
            kill_deadline = Some(Instant::now() + STOP_GRACE);
            for child in children.iter() {
                let _ = signal_pid(child.id(), false);
            }
        }
        if let Some(deadline) = kill_deadline
            && Instant::now() >= deadline
        {
            for child in children.iter() {
                let _ = signal_pid(child.id(), true);
            }
            for child in children.iter_mut() {
                let _ = child.wait();
            }
            children.clear();
            return;
        }

        std::thread::sleep(WAIT_POLL);
    }
}

/// Fire-and-forget stop: signal every registered PID and leave draining to
/// the workers' own grace windows. Gone PIDs are reported, not errors.
pub(crate) fn stop(storage_dir: &Path) -> Result<(), CliError> {
    let pids = read_registry(storage_dir);
    if pids.is_empty() {
        println!("[WARN] No active workers found");
        return Ok(());
    }

    for pid in pids {
        match signal_pid(pid, false) {
            Ok(()) => println!("[OK] Sent stop signal to worker PID {pid}"),
            Err(_) => println!("[WARN] Worker PID {pid} not found"),
        }
    }
    Ok(())
}
