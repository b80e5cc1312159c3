#![forbid(unsafe_code)]

use crate::error::CliError;
use crate::supervisor;
use qc_core::config::QueueConfig;
use qc_core::model::JobState;
use qc_storage::{JobCounts, JobRow, SqliteStore, now_ms};
use serde::Deserialize;
use std::path::Path;

pub(crate) const DEFAULT_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    id: String,
    command: String,
    #[serde(default)]
    max_retries: Option<u32>,
}

/// `enqueue <json>`: validate the payload and insert the job in `pending`.
/// The stored `max_retries` is the enqueue-time snapshot; the retry decision
/// itself reads live config.
pub(crate) fn enqueue(
    store: &mut SqliteStore,
    storage_dir: &Path,
    job_json: &str,
) -> Result<JobRow, CliError> {
    let request: EnqueueRequest = serde_json::from_str(job_json)
        .map_err(|err| CliError::Validation(format!("invalid job JSON: {err}")))?;
    let config = QueueConfig::load(storage_dir)?;
    let max_retries = request.max_retries.unwrap_or(config.max_retries);
    Ok(store.job_insert(&request.id, &request.command, max_retries, now_ms())?)
}

pub(crate) struct StatusReport {
    pub(crate) counts: JobCounts,
    pub(crate) worker_pids: Vec<u32>,
}

pub(crate) fn status(store: &SqliteStore, storage_dir: &Path) -> Result<StatusReport, CliError> {
    Ok(StatusReport {
        counts: store.jobs_counts()?,
        worker_pids: supervisor::active_workers(storage_dir),
    })
}

pub(crate) fn list(
    store: &SqliteStore,
    state: Option<JobState>,
    limit: usize,
) -> Result<Vec<JobRow>, CliError> {
    Ok(store.jobs_list(state, limit)?)
}

pub(crate) fn dlq_retry(store: &mut SqliteStore, id: &str) -> Result<JobRow, CliError> {
    Ok(store.job_dlq_retry(id, now_ms())?)
}

pub(crate) fn print_status(report: &StatusReport) {
    println!();
    println!("=== Queue Status ===");
    println!("Pending:    {}", report.counts.pending);
    println!("Processing: {}", report.counts.processing);
    println!("Completed:  {}", report.counts.completed);
    println!("Failed:     {}", report.counts.failed);
    println!("Dead (DLQ): {}", report.counts.dead);
    println!();
    println!("Active Workers: {}", report.worker_pids.len());
    if !report.worker_pids.is_empty() {
        let pids = report
            .worker_pids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("PIDs: {pids}");
    }
}

pub(crate) fn print_job(job: &JobRow) {
    println!("ID: {}", job.id);
    println!("  Command:  {}", job.command);
    println!("  State:    {}", job.state.as_str());
    println!("  Attempts: {}/{}", job.attempts, job.max_retries.saturating_add(1));
    println!("  Created:  {}", crate::support::ts_ms_to_rfc3339(job.created_at));
    if let Some(error) = job.last_error.as_deref() {
        println!("  Error:    {}", one_line(error, 100));
    }
    if let Some(next_retry_at) = job.next_retry_at {
        println!("  Retry at: {}", crate::support::ts_ms_to_rfc3339(next_retry_at));
    }
    if let Some(worker) = job.locked_by.as_deref() {
        println!("  Worker:   {worker}");
    }
    println!();
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    flat.chars().take(max_chars).collect()
}
