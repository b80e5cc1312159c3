#![forbid(unsafe_code)]

use super::*;
use qc_core::policy::RetryDecision;
use rusqlite::{OptionalExtension, params};

const MAX_JOB_ID_LEN: usize = 200;
const MAX_COMMAND_LEN: usize = 10_000;
const MAX_WORKER_ID_LEN: usize = 256;
const MAX_LAST_ERROR_LEN: usize = 400;
const MAX_OUTPUT_LEN: usize = 16 * 1024;
pub const MAX_LIST_LIMIT: usize = 500;

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, \
     updated_at, next_retry_at, locked_by, locked_at, last_error, output";

/// I6: a row is leasable iff it is pending, failed past its backoff, or
/// processing under a lease older than the TTL. `?1` is now, `?2` the TTL,
/// both in milliseconds.
const LEASABLE_PREDICATE: &str = "(state='pending' \
     OR (state='failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1) \
     OR (state='processing' AND locked_at IS NOT NULL AND locked_at < ?1 - ?2))";

fn normalize_job_id(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("job id must not be empty"));
    }
    if raw.len() > MAX_JOB_ID_LEN {
        return Err(StoreError::InvalidInput("job id is too long"));
    }
    if raw.chars().any(char::is_control) {
        return Err(StoreError::InvalidInput(
            "job id must not contain control characters",
        ));
    }
    Ok(raw.to_string())
}

fn normalize_command(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("command must not be empty"));
    }
    if raw.len() > MAX_COMMAND_LEN {
        return Err(StoreError::InvalidInput("command is too long"));
    }
    Ok(raw.to_string())
}

fn normalize_worker_id(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("worker id must not be empty"));
    }
    if raw.len() > MAX_WORKER_ID_LEN {
        return Err(StoreError::InvalidInput("worker id is too long"));
    }
    Ok(raw.to_string())
}

fn clamp_last_error(raw: &str) -> String {
    raw.trim().chars().take(MAX_LAST_ERROR_LEN).collect()
}

fn clamp_output(raw: Option<&str>) -> Option<String> {
    raw.map(|s| s.chars().take(MAX_OUTPUT_LEN).collect())
}

fn parse_state(column: usize, raw: String) -> Result<JobState, rusqlite::Error> {
    JobState::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown job state '{raw}'").into(),
        )
    })
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: row.get(0)?,
        command: row.get(1)?,
        state: parse_state(2, row.get(2)?)?,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        next_retry_at: row.get(7)?,
        locked_by: row.get(8)?,
        locked_at: row.get(9)?,
        last_error: row.get(10)?,
        output: row.get(11)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteStore {
    /// Insert a fresh job in `pending`. An existing id is never overwritten.
    pub fn job_insert(
        &mut self,
        id: &str,
        command: &str,
        max_retries: u32,
        now_ms: i64,
    ) -> Result<JobRow, StoreError> {
        let id = normalize_job_id(id)?;
        let command = normalize_command(command)?;

        let tx = self.tx_immediate()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO jobs(id, command, state, attempts, max_retries,
                             created_at, updated_at, next_retry_at,
                             locked_by, locked_at, last_error, output)
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, NULL, NULL, NULL, NULL, NULL)
            "#,
            params![id, command, max_retries, now_ms],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateId { id });
            }
            Err(err) => return Err(err.into()),
        }
        tx.commit()?;

        Ok(JobRow {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now_ms,
            updated_at: now_ms,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            last_error: None,
            output: None,
        })
    }

    /// Atomically lease the oldest leasable job for `worker_id`, or return
    /// `None` when nothing is due. The candidate is picked and re-guarded
    /// inside one IMMEDIATE transaction, so concurrent workers never observe
    /// the same row twice even across stale-lease reclaims.
    pub fn job_acquire(
        &mut self,
        worker_id: &str,
        now_ms: i64,
        lease_ttl_ms: i64,
    ) -> Result<Option<JobRow>, StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;

        let tx = self.tx_immediate()?;
        let candidate: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT id FROM jobs WHERE {LEASABLE_PREDICATE} \
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![now_ms, lease_ttl_ms],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            &format!(
                "UPDATE jobs \
                 SET state='processing', locked_by=?3, locked_at=?1, updated_at=?1 \
                 WHERE id=?4 AND {LEASABLE_PREDICATE}"
            ),
            params![now_ms, lease_ttl_ms, worker_id, id],
        )?;
        if changed != 1 {
            return Ok(None);
        }

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
            params![id],
            read_job_row,
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Terminal success. The attempt counter covers every terminated
    /// execution, so the closing attempt is recorded here too. The guard on
    /// `locked_by` means a worker whose lease was reclaimed gets `LeaseLost`
    /// instead of clobbering the new owner.
    pub fn job_complete(
        &mut self,
        id: &str,
        worker_id: &str,
        output: Option<&str>,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let id = normalize_job_id(id)?;
        let worker_id = normalize_worker_id(worker_id)?;
        let output = clamp_output(output);

        let tx = self.tx_immediate()?;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET state='completed', attempts=attempts+1, locked_by=NULL,
                locked_at=NULL, next_retry_at=NULL, last_error=NULL,
                output=?1, updated_at=?2
            WHERE id=?3 AND state='processing' AND locked_by=?4
            "#,
            params![output, now_ms, id, worker_id],
        )?;
        if changed != 1 {
            return Err(StoreError::LeaseLost { id });
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt and apply the policy verdict: `Retry(delay)`
    /// parks the job in `failed` until `now + delay`, `Dead` moves it to the
    /// DLQ. Either way the attempt counter advances and the lease is released.
    pub fn job_fail(
        &mut self,
        id: &str,
        worker_id: &str,
        error: &str,
        output: Option<&str>,
        decision: RetryDecision,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let id = normalize_job_id(id)?;
        let worker_id = normalize_worker_id(worker_id)?;
        let last_error = clamp_last_error(error);
        let output = clamp_output(output);

        let (state, next_retry_at) = match decision {
            RetryDecision::Retry { delay_s } => {
                let delay_ms = (delay_s.min(i64::MAX as u64 / 1_000) as i64) * 1_000;
                (JobState::Failed, Some(now_ms.saturating_add(delay_ms)))
            }
            RetryDecision::Dead => (JobState::Dead, None),
        };

        let tx = self.tx_immediate()?;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET state=?1, attempts=attempts+1, next_retry_at=?2,
                locked_by=NULL, locked_at=NULL, last_error=?3, output=?4,
                updated_at=?5
            WHERE id=?6 AND state='processing' AND locked_by=?7
            "#,
            params![
                state.as_str(),
                next_retry_at,
                last_error,
                output,
                now_ms,
                id,
                worker_id
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::LeaseLost { id });
        }
        tx.commit()?;
        Ok(())
    }

    /// Refresh `locked_at` so a healthy long-running job is not reclaimed.
    pub fn job_heartbeat(
        &mut self,
        id: &str,
        worker_id: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let id = normalize_job_id(id)?;
        let worker_id = normalize_worker_id(worker_id)?;

        let tx = self.tx_immediate()?;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET locked_at=?1, updated_at=?1
            WHERE id=?2 AND state='processing' AND locked_by=?3
            "#,
            params![now_ms, id, worker_id],
        )?;
        if changed != 1 {
            return Err(StoreError::LeaseLost { id });
        }
        tx.commit()?;
        Ok(())
    }

    /// Reset a dead job to a fresh `pending`. Any other state is an invalid
    /// transition; re-running live jobs goes through the normal lease path.
    pub fn job_dlq_retry(&mut self, id: &str, now_ms: i64) -> Result<JobRow, StoreError> {
        let id = normalize_job_id(id)?;

        let tx = self.tx_immediate()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM jobs WHERE id=?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw_state) = current else {
            return Err(StoreError::NotFound { id });
        };
        let state = parse_state(0, raw_state)?;
        if state != JobState::Dead {
            return Err(StoreError::InvalidTransition { id, state });
        }

        tx.execute(
            r#"
            UPDATE jobs
            SET state='pending', attempts=0, next_retry_at=NULL,
                locked_by=NULL, locked_at=NULL, last_error=NULL, updated_at=?1
            WHERE id=?2 AND state='dead'
            "#,
            params![now_ms, id],
        )?;

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
            params![id],
            read_job_row,
        )?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_get(&self, id: &str) -> Result<Option<JobRow>, StoreError> {
        let id = normalize_job_id(id)?;
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                params![id],
                read_job_row,
            )
            .optional()?)
    }

    /// Enumerate jobs oldest-first, optionally filtered by state.
    pub fn jobs_list(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR state=?1) \
             ORDER BY created_at ASC, id ASC \
             LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![state.map(JobState::as_str), limit as i64])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(read_job_row(row)?);
        }
        Ok(jobs)
    }

    pub fn jobs_counts(&self) -> Result<JobCounts, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
              COALESCE(SUM(CASE WHEN state='pending' THEN 1 ELSE 0 END), 0),
              COALESCE(SUM(CASE WHEN state='processing' THEN 1 ELSE 0 END), 0),
              COALESCE(SUM(CASE WHEN state='completed' THEN 1 ELSE 0 END), 0),
              COALESCE(SUM(CASE WHEN state='failed' THEN 1 ELSE 0 END), 0),
              COALESCE(SUM(CASE WHEN state='dead' THEN 1 ELSE 0 END), 0)
            FROM jobs
            "#,
        )?;
        let counts = stmt.query_row([], |row| {
            Ok(JobCounts {
                pending: row.get::<_, i64>(0)?.max(0) as u64,
                processing: row.get::<_, i64>(1)?.max(0) as u64,
                completed: row.get::<_, i64>(2)?.max(0) as u64,
                failed: row.get::<_, i64>(3)?.max(0) as u64,
                dead: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?;
        Ok(counts)
    }
}
