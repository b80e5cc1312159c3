#![forbid(unsafe_code)]

mod admin;
mod error;
mod shutdown;
mod supervisor;
mod support;

use error::CliError;
use qc_core::config::QueueConfig;
use qc_core::model::JobState;
use qc_storage::SqliteStore;
use shutdown::ShutdownToken;
use std::path::{Path, PathBuf};

fn usage() -> &'static str {
    "queuectl — CLI-operated background job queue\n\n\
USAGE:\n\
  queuectl [--storage-dir DIR] COMMAND\n\n\
COMMANDS:\n\
  enqueue '{\"id\": ..., \"command\": ...}'   add a job (optional \"max_retries\")\n\
  worker start [--count N]                 run N worker processes (default 1)\n\
  worker stop                              signal registered workers to stop\n\
  status                                   per-state counts and live worker PIDs\n\
  list [--state S] [--limit N]             list jobs, oldest first\n\
  dlq list                                 list dead-lettered jobs\n\
  dlq retry ID                             move a dead job back to pending\n\
  config get [KEY] | set KEY VALUE | list  manage queue settings\n\n\
NOTES:\n\
  - state files (queuectl.db, queuectl_config.json, queuectl_workers.pid)\n\
    live in --storage-dir (env QUEUECTL_STORAGE_DIR, default '.').\n\
  - exit codes: 0 ok, 1 user error, 2 not found, 3 invalid transition.\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Pull `--storage-dir DIR` out of the argument list wherever it appears so
/// subcommand parsing below only sees its own flags.
fn extract_storage_dir(args: &mut Vec<String>) -> Result<PathBuf, CliError> {
    let mut dir: Option<PathBuf> = env_var("QUEUECTL_STORAGE_DIR").map(PathBuf::from);
    while let Some(pos) = args.iter().position(|a| a == "--storage-dir") {
        if pos + 1 >= args.len() {
            return Err(CliError::Usage("--storage-dir requires DIR".to_string()));
        }
        dir = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }
    Ok(dir.unwrap_or_else(|| PathBuf::from(".")))
}

fn expect_no_extra_args(args: &[String], from: usize) -> Result<(), CliError> {
    if let Some(extra) = args.get(from) {
        return Err(CliError::Usage(format!("unexpected argument '{extra}'")));
    }
    Ok(())
}

fn cmd_enqueue(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    let job_json = args
        .get(1)
        .ok_or_else(|| CliError::Usage("enqueue requires a JSON argument".to_string()))?;
    expect_no_extra_args(args, 2)?;

    let mut store = SqliteStore::open(storage_dir)?;
    let job = admin::enqueue(&mut store, storage_dir, job_json)?;
    println!("[OK] Job '{}' enqueued successfully", job.id);
    Ok(())
}

fn cmd_worker(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    match args.get(1).map(String::as_str) {
        Some("start") => {
            let mut count: u32 = 1;
            let mut i = 2usize;
            while i < args.len() {
                match args[i].as_str() {
                    "--count" => {
                        i += 1;
                        let v = args
                            .get(i)
                            .ok_or_else(|| CliError::Usage("--count requires N".to_string()))?;
                        count = v.parse::<u32>().ok().filter(|n| *n >= 1).ok_or_else(|| {
                            CliError::Usage("--count must be a positive integer".to_string())
                        })?;
                    }
                    other => {
                        return Err(CliError::Usage(format!("unexpected argument '{other}'")));
                    }
                }
                i += 1;
            }
            let shutdown = ShutdownToken::install()?;
            supervisor::start(storage_dir, count, &shutdown)
        }
        Some("stop") => {
            expect_no_extra_args(args, 2)?;
            supervisor::stop(storage_dir)
        }
        _ => Err(CliError::Usage(
            "worker requires 'start' or 'stop'".to_string(),
        )),
    }
}

fn cmd_status(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    expect_no_extra_args(args, 1)?;
    let store = SqliteStore::open(storage_dir)?;
    let report = admin::status(&store, storage_dir)?;
    admin::print_status(&report);
    Ok(())
}

fn cmd_list(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    let mut state: Option<JobState> = None;
    let mut limit = admin::DEFAULT_LIST_LIMIT;
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--state" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| CliError::Usage("--state requires S".to_string()))?;
                state = Some(JobState::parse(v).ok_or_else(|| {
                    CliError::Validation(format!(
                        "unknown state '{v}' (expected pending|processing|completed|failed|dead)"
                    ))
                })?);
            }
            "--limit" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| CliError::Usage("--limit requires N".to_string()))?;
                limit = v.parse::<usize>().ok().filter(|n| *n >= 1).ok_or_else(|| {
                    CliError::Usage("--limit must be a positive integer".to_string())
                })?;
            }
            other => return Err(CliError::Usage(format!("unexpected argument '{other}'"))),
        }
        i += 1;
    }

    let store = SqliteStore::open(storage_dir)?;
    let jobs = admin::list(&store, state, limit)?;
    if jobs.is_empty() {
        match state {
            Some(s) => println!("No jobs found with state: {}", s.as_str()),
            None => println!("No jobs found"),
        }
        return Ok(());
    }

    match state {
        Some(s) => println!("\n=== Jobs ({}) ===\n", s.as_str()),
        None => println!("\n=== Jobs ===\n"),
    }
    for job in &jobs {
        admin::print_job(job);
    }
    Ok(())
}

fn cmd_dlq(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    match args.get(1).map(String::as_str) {
        Some("list") => {
            expect_no_extra_args(args, 2)?;
            let store = SqliteStore::open(storage_dir)?;
            let jobs = admin::list(&store, Some(JobState::Dead), admin::DEFAULT_LIST_LIMIT)?;
            if jobs.is_empty() {
                println!("No jobs in Dead Letter Queue");
                return Ok(());
            }
            println!("\n=== Dead Letter Queue ({} jobs) ===\n", jobs.len());
            for job in &jobs {
                admin::print_job(job);
            }
            Ok(())
        }
        Some("retry") => {
            let id = args
                .get(2)
                .ok_or_else(|| CliError::Usage("dlq retry requires a job id".to_string()))?;
            expect_no_extra_args(args, 3)?;
            let mut store = SqliteStore::open(storage_dir)?;
            let job = admin::dlq_retry(&mut store, id)?;
            println!("[OK] Job '{}' moved from DLQ back to pending queue", job.id);
            Ok(())
        }
        _ => Err(CliError::Usage(
            "dlq requires 'list' or 'retry ID'".to_string(),
        )),
    }
}

fn cmd_config(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    fn print_all(config: &QueueConfig) {
        println!("\n=== Configuration ===");
        for (key, value) in config.entries() {
            println!("{key}: {value}");
        }
    }

    match args.get(1).map(String::as_str) {
        Some("get") => {
            expect_no_extra_args(args, 3)?;
            let config = QueueConfig::load(storage_dir)?;
            match args.get(2) {
                Some(key) => {
                    let value = config.get(key)?;
                    println!("{key}: {value}");
                }
                None => print_all(&config),
            }
            Ok(())
        }
        Some("set") => {
            let key = args
                .get(2)
                .ok_or_else(|| CliError::Usage("config set requires KEY VALUE".to_string()))?;
            let value = args
                .get(3)
                .ok_or_else(|| CliError::Usage("config set requires KEY VALUE".to_string()))?;
            expect_no_extra_args(args, 4)?;
            let mut config = QueueConfig::load(storage_dir)?;
            config.set(key, value)?;
            config.save(storage_dir)?;
            println!("[OK] Configuration updated: {key} = {value}");
            Ok(())
        }
        Some("list") => {
            expect_no_extra_args(args, 2)?;
            print_all(&QueueConfig::load(storage_dir)?);
            Ok(())
        }
        _ => Err(CliError::Usage(
            "config requires 'get', 'set' or 'list'".to_string(),
        )),
    }
}

fn dispatch(storage_dir: &Path, args: &[String]) -> Result<(), CliError> {
    let Some(command) = args.first() else {
        return Err(CliError::Usage(usage().to_string()));
    };
    match command.as_str() {
        "enqueue" => cmd_enqueue(storage_dir, args),
        "worker" => cmd_worker(storage_dir, args),
        "status" => cmd_status(storage_dir, args),
        "list" => cmd_list(storage_dir, args),
        "dlq" => cmd_dlq(storage_dir, args),
        "config" => cmd_config(storage_dir, args),
        other => Err(CliError::Usage(format!(
            "Unknown command: {other}\n\n{}",
            usage()
        ))),
    }
}

fn run() -> i32 {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        return 0;
    }
    let storage_dir = match extract_storage_dir(&mut args) {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("[ERR] {err}");
            return err.exit_code();
        }
    };
    match dispatch(&storage_dir, &args) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("[ERR] {err}");
            err.exit_code()
        }
    }
}

fn main() {
    std::process::exit(run());
}
