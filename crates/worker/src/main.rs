#![forbid(unsafe_code)]

mod executor;
mod shutdown;

use executor::{ExecOutcome, ExecParams};
use qc_core::config::QueueConfig;
use qc_core::policy::{self, RetryDecision};
use qc_storage::{JobRow, SqliteStore, StoreError, now_ms};
use shutdown::ShutdownToken;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const TERM_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_LIMIT: usize = 16 * 1024;
const DEFAULT_SHUTDOWN_GRACE_S: u64 = 30;

#[derive(Debug)]
struct WorkerConfig {
    storage_dir: PathBuf,
    worker_id: String,
    shutdown_grace_s: u64,
    once: bool,
}

fn usage() -> &'static str {
    "queuectl_worker — job-queue worker process\n\n\
USAGE:\n\
  queuectl_worker [--storage-dir DIR] [--worker-id ID]\n\
                  [--shutdown-grace-s S] [--once]\n\n\
NOTES:\n\
  - one job at a time; leases are taken and released through the store.\n\
  - SIGTERM/SIGINT stop the loop; the running job gets the grace window,\n\
    then its lease is abandoned for another worker to reclaim.\n\
  - `--once` processes at most one job and exits (smoke testing).\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_worker_id() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

fn parse_args() -> Result<WorkerConfig, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut storage_dir: Option<PathBuf> = env_var("QUEUECTL_STORAGE_DIR").map(PathBuf::from);
    let mut worker_id: Option<String> = env_var("QUEUECTL_WORKER_ID");
    let mut shutdown_grace_s: u64 = env_var("QUEUECTL_SHUTDOWN_GRACE_S")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_S);
    let mut once = false;

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--storage-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--storage-dir requires DIR")?;
                storage_dir = Some(PathBuf::from(v));
            }
            "--worker-id" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-id requires ID")?;
                worker_id = Some(v.to_string());
            }
            "--shutdown-grace-s" => {
                i += 1;
                let v = args.get(i).ok_or("--shutdown-grace-s requires S")?;
                shutdown_grace_s = v
                    .parse::<u64>()
                    .map_err(|_| "--shutdown-grace-s must be an integer (seconds)")?;
            }
            "--once" => once = true,
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    Ok(WorkerConfig {
        storage_dir: storage_dir.unwrap_or_else(|| PathBuf::from(".")),
        worker_id: worker_id.unwrap_or_else(default_worker_id),
        shutdown_grace_s,
        once,
    })
}

fn load_queue_config(storage_dir: &std::path::Path, worker_id: &str) -> QueueConfig {
    match QueueConfig::load(storage_dir) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("[worker {worker_id}] config unreadable, using defaults: {err}");
            QueueConfig::default()
        }
    }
}

/// One pass of the worker loop: lease, execute, report. Every store write is
/// guarded by the worker id, so a lease that expired mid-run degrades into a
/// logged `LeaseLost` instead of a double transition.
fn process_job(
    store: &mut SqliteStore,
    worker_cfg: &WorkerConfig,
    queue_cfg: &QueueConfig,
    job: &JobRow,
    shutdown: &ShutdownToken,
) {
    let worker_id = worker_cfg.worker_id.as_str();
    eprintln!(
        "[worker {worker_id}] processing job '{}' (attempt {})",
        job.id,
        job.attempts + 1
    );

    let params = ExecParams {
        timeout: queue_cfg.job_timeout(),
        term_grace: TERM_GRACE,
        shutdown_grace: Duration::from_secs(worker_cfg.shutdown_grace_s),
        output_limit: OUTPUT_LIMIT,
    };

    // Refresh the lease at half the TTL so a healthy long-running job is
    // never reclaimed out from under us.
    let heartbeat_every = Duration::from_millis((queue_cfg.lease_ttl_ms() / 2).max(1_000) as u64);
    let mut last_beat = Instant::now();
    let mut lease_lost = false;
    let job_id = job.id.clone();
    let outcome = {
        let store = &mut *store;
        executor::run(&job.command, &params, shutdown, &mut || {
            if lease_lost || last_beat.elapsed() < heartbeat_every {
                return;
            }
            last_beat = Instant::now();
            match store.job_heartbeat(&job_id, worker_id, now_ms()) {
                Ok(()) => {}
                Err(StoreError::LeaseLost { .. }) => {
                    eprintln!("[worker {worker_id}] lease on '{job_id}' lost during heartbeat");
                    lease_lost = true;
                }
                Err(err) => {
                    eprintln!("[worker {worker_id}] heartbeat failed: {err}");
                }
            }
        })
    };

    match outcome {
        ExecOutcome::Success { output } => {
            let output = (!output.is_empty()).then_some(output);
            match store.job_complete(&job.id, worker_id, output.as_deref(), now_ms()) {
                Ok(()) => eprintln!("[worker {worker_id}] job '{}' completed", job.id),
                Err(StoreError::LeaseLost { .. }) => {
                    eprintln!(
                        "[worker {worker_id}] job '{}' finished but the lease moved on; \
                         dropping the result",
                        job.id
                    );
                }
                Err(err) => {
                    eprintln!("[worker {worker_id}] failed to record completion: {err}");
                }
            }
        }
        ExecOutcome::Failure {
            output,
            reason,
            message,
            ..
        } => {
            // the policy reads live config at decision time, not the
            // snapshot taken at enqueue
            let live = load_queue_config(&worker_cfg.storage_dir, worker_id);
            let attempts_after = job.attempts.saturating_add(1);
            let decision = policy::decide(attempts_after, live.max_retries, live.backoff_base);
            let output = (!output.is_empty()).then_some(output);
            match store.job_fail(
                &job.id,
                worker_id,
                &message,
                output.as_deref(),
                decision,
                now_ms(),
            ) {
                Ok(()) => match decision {
                    RetryDecision::Retry { delay_s } => eprintln!(
                        "[worker {worker_id}] job '{}' failed ({}); retry in {delay_s}s \
                         (attempt {attempts_after}/{})",
                        job.id,
                        reason.as_str(),
                        live.max_retries.saturating_add(1)
                    ),
                    RetryDecision::Dead => eprintln!(
                        "[worker {worker_id}] job '{}' moved to the dead letter queue \
                         after {attempts_after} attempts",
                        job.id
                    ),
                },
                Err(StoreError::LeaseLost { .. }) => {
                    eprintln!(
                        "[worker {worker_id}] job '{}' failed but the lease moved on",
                        job.id
                    );
                }
                Err(err) => {
                    eprintln!("[worker {worker_id}] failed to record failure: {err}");
                }
            }
        }
        ExecOutcome::Cancelled => {
            // deliberately no store write: a cancelled worker must look like
            // a crashed one, so stale-lease recovery picks the job up
            eprintln!(
                "[worker {worker_id}] shutdown during job '{}'; leaving the lease to expire",
                job.id
            );
        }
    }
}

fn run_loop(store: &mut SqliteStore, worker_cfg: &WorkerConfig, shutdown: &ShutdownToken) {
    let worker_id = worker_cfg.worker_id.as_str();
    eprintln!("[worker {worker_id}] started");

    while !shutdown.requested() {
        let queue_cfg = load_queue_config(&worker_cfg.storage_dir, worker_id);
        match store.job_acquire(worker_id, now_ms(), queue_cfg.lease_ttl_ms()) {
            Ok(Some(job)) => {
                process_job(store, worker_cfg, &queue_cfg, &job, shutdown);
                if worker_cfg.once {
                    break;
                }
            }
            Ok(None) => {
                if worker_cfg.once {
                    break;
                }
                shutdown.sleep(queue_cfg.poll_interval());
            }
            Err(err) => {
                eprintln!("[worker {worker_id}] store unavailable: {err}");
                shutdown.sleep(queue_cfg.poll_interval());
            }
        }
    }

    eprintln!("[worker {worker_id}] stopped");
}

fn main() {
    let worker_cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let shutdown = match ShutdownToken::install() {
        Ok(token) => token,
        Err(err) => {
            eprintln!("failed to install signal handlers: {err}");
            std::process::exit(1);
        }
    };
    let mut store = match SqliteStore::open(&worker_cfg.storage_dir) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open job store: {err}");
            std::process::exit(1);
        }
    };
    run_loop(&mut store, &worker_cfg, &shutdown);
}
