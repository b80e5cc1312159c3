#![forbid(unsafe_code)]

use qc_core::model::JobState;
use qc_core::policy::RetryDecision;
use qc_storage::{SqliteStore, StoreError};
use std::path::PathBuf;

const TTL_MS: i64 = 300_000;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("qc_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn insert_starts_pending_with_zero_attempts() {
    let dir = temp_dir("insert_starts_pending");
    let mut store = SqliteStore::open(&dir).expect("open store");

    let job = store
        .job_insert("job-1", "echo hi", 3, 1_000)
        .expect("insert");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.created_at, 1_000);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert!(job.next_retry_at.is_none());

    let fetched = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(fetched.command, "echo hi");
    assert_eq!(fetched.state, JobState::Pending);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn duplicate_insert_is_rejected_and_leaves_store_unchanged() {
    let dir = temp_dir("duplicate_insert_rejected");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store
        .job_insert("job-1", "echo first", 3, 1_000)
        .expect("insert");
    let err = store
        .job_insert("job-1", "echo second", 9, 2_000)
        .expect_err("duplicate must fail");
    match err {
        StoreError::DuplicateId { id } => assert_eq!(id, "job-1"),
        other => panic!("expected DuplicateId, got {other:?}"),
    }

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.command, "echo first");
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.created_at, 1_000);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn insert_validates_id_and_command() {
    let dir = temp_dir("insert_validates_input");
    let mut store = SqliteStore::open(&dir).expect("open store");

    assert!(matches!(
        store.job_insert("  ", "echo hi", 3, 1_000),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        store.job_insert("job-1", "   ", 3, 1_000),
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        store.job_insert("job\nwith-newline", "echo hi", 3, 1_000),
        Err(StoreError::InvalidInput(_))
    ));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn acquire_locks_oldest_job_first() {
    let dir = temp_dir("acquire_oldest_first");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("newer", "echo b", 3, 2_000).expect("insert");
    store.job_insert("older", "echo a", 3, 1_000).expect("insert");

    let job = store
        .job_acquire("host:1", 10_000, TTL_MS)
        .expect("acquire")
        .expect("job available");
    assert_eq!(job.id, "older");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.locked_by.as_deref(), Some("host:1"));
    assert_eq!(job.locked_at, Some(10_000));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn acquire_breaks_created_at_ties_by_ascending_id() {
    let dir = temp_dir("acquire_tie_break");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("b", "echo b", 3, 1_000).expect("insert");
    store.job_insert("a", "echo a", 3, 1_000).expect("insert");

    let job = store
        .job_acquire("host:1", 10_000, TTL_MS)
        .expect("acquire")
        .expect("job available");
    assert_eq!(job.id, "a");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn acquire_returns_none_on_empty_queue() {
    let dir = temp_dir("acquire_empty");
    let mut store = SqliteStore::open(&dir).expect("open store");
    assert!(store.job_acquire("host:1", 10_000, TTL_MS).expect("acquire").is_none());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn complete_clears_lease_and_records_output() {
    let dir = temp_dir("complete_clears_lease");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "echo hi", 3, 1_000).expect("insert");
    store
        .job_acquire("host:1", 2_000, TTL_MS)
        .expect("acquire")
        .expect("leased");
    store
        .job_complete("job-1", "host:1", Some("hi\n"), 3_000)
        .expect("complete");

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert_eq!(job.output.as_deref(), Some("hi\n"));
    assert!(job.last_error.is_none());
    assert_eq!(job.updated_at, 3_000);

    // terminal jobs are never leasable again
    assert!(store.job_acquire("host:2", 9_999_999, TTL_MS).expect("acquire").is_none());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fail_with_retry_parks_job_until_backoff_elapses() {
    let dir = temp_dir("fail_retry_backoff");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "exit 1", 3, 1_000).expect("insert");
    store
        .job_acquire("host:1", 2_000, TTL_MS)
        .expect("acquire")
        .expect("leased");
    store
        .job_fail(
            "job-1",
            "host:1",
            "exit code 1",
            Some("boom"),
            RetryDecision::Retry { delay_s: 4 },
            2_500,
        )
        .expect("fail");

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_retry_at, Some(6_500));
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert_eq!(job.last_error.as_deref(), Some("exit code 1"));
    assert_eq!(job.output.as_deref(), Some("boom"));

    // not leasable one ms before the retry time, leasable at it
    assert!(store.job_acquire("host:2", 6_499, TTL_MS).expect("acquire").is_none());
    let again = store
        .job_acquire("host:2", 6_500, TTL_MS)
        .expect("acquire")
        .expect("due for retry");
    assert_eq!(again.id, "job-1");
    assert_eq!(again.state, JobState::Processing);
    assert_eq!(again.locked_by.as_deref(), Some("host:2"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fail_with_dead_moves_job_to_dlq() {
    let dir = temp_dir("fail_dead_dlq");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "exit 1", 0, 1_000).expect("insert");
    store
        .job_acquire("host:1", 2_000, TTL_MS)
        .expect("acquire")
        .expect("leased");
    store
        .job_fail(
            "job-1",
            "host:1",
            "exit code 1",
            None,
            RetryDecision::Dead,
            2_500,
        )
        .expect("fail");

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
    assert!(job.next_retry_at.is_none());
    assert!(job.locked_by.is_none());

    assert!(store.job_acquire("host:2", 9_999_999, TTL_MS).expect("acquire").is_none());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn attempts_accumulate_across_retries() {
    let dir = temp_dir("attempts_accumulate");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "exit 1", 3, 0).expect("insert");
    let mut now = 1_000;
    for expected_attempts in 1..=3u32 {
        store
            .job_acquire("host:1", now, TTL_MS)
            .expect("acquire")
            .expect("leased");
        store
            .job_fail(
                "job-1",
                "host:1",
                "exit code 1",
                None,
                RetryDecision::Retry { delay_s: 1 },
                now,
            )
            .expect("fail");
        let job = store.job_get("job-1").expect("get").expect("exists");
        assert_eq!(job.attempts, expected_attempts);
        now += 10_000;
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn attempts_count_the_closing_success_too() {
    let dir = temp_dir("attempts_count_success");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "flaky", 3, 0).expect("insert");
    let mut now = 1_000;
    for _ in 0..2 {
        store
            .job_acquire("host:1", now, TTL_MS)
            .expect("acquire")
            .expect("leased");
        store
            .job_fail(
                "job-1",
                "host:1",
                "exit code 1",
                None,
                RetryDecision::Retry { delay_s: 1 },
                now,
            )
            .expect("fail");
        now += 10_000;
    }
    store
        .job_acquire("host:1", now, TTL_MS)
        .expect("acquire")
        .expect("leased");
    store
        .job_complete("job-1", "host:1", Some("ok\n"), now)
        .expect("complete");

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.is_none());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn dlq_retry_resets_dead_job_to_fresh_pending() {
    let dir = temp_dir("dlq_retry_resets");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "exit 1", 0, 1_000).expect("insert");
    store
        .job_acquire("host:1", 2_000, TTL_MS)
        .expect("acquire")
        .expect("leased");
    store
        .job_fail(
            "job-1",
            "host:1",
            "exit code 1",
            None,
            RetryDecision::Dead,
            2_500,
        )
        .expect("fail");

    let job = store.job_dlq_retry("job-1", 5_000).expect("dlq retry");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.next_retry_at.is_none());
    assert!(job.last_error.is_none());
    assert!(job.locked_by.is_none());
    assert_eq!(job.updated_at, 5_000);
    // created_at is preserved; the job keeps its place in the queue order.
    assert_eq!(job.created_at, 1_000);

    let leased = store
        .job_acquire("host:2", 6_000, TTL_MS)
        .expect("acquire")
        .expect("pending again");
    assert_eq!(leased.id, "job-1");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn dlq_retry_rejects_unknown_and_non_dead_jobs() {
    let dir = temp_dir("dlq_retry_rejects");
    let mut store = SqliteStore::open(&dir).expect("open store");

    match store.job_dlq_retry("missing", 1_000) {
        Err(StoreError::NotFound { id }) => assert_eq!(id, "missing"),
        other => panic!("expected NotFound, got {other:?}"),
    }

    store.job_insert("job-1", "echo hi", 3, 1_000).expect("insert");
    match store.job_dlq_retry("job-1", 2_000) {
        Err(StoreError::InvalidTransition { id, state }) => {
            assert_eq!(id, "job-1");
            assert_eq!(state, JobState::Pending);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.state, JobState::Pending);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn list_orders_by_created_at_ascending_and_filters_by_state() {
    let dir = temp_dir("list_orders_and_filters");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("third", "echo c", 3, 3_000).expect("insert");
    store.job_insert("first", "echo a", 3, 1_000).expect("insert");
    store.job_insert("second", "echo b", 3, 2_000).expect("insert");

    let all = store.jobs_list(None, 100).expect("list");
    let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, ["first", "second", "third"]);

    store
        .job_acquire("host:1", 10_000, TTL_MS)
        .expect("acquire")
        .expect("leased");
    let processing = store
        .jobs_list(Some(JobState::Processing), 100)
        .expect("list");
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, "first");

    let pending = store.jobs_list(Some(JobState::Pending), 100).expect("list");
    assert_eq!(pending.len(), 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn counts_track_every_state() {
    let dir = temp_dir("counts_track_states");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("p1", "echo", 3, 1_000).expect("insert");
    store.job_insert("p2", "echo", 3, 1_000).expect("insert");
    store.job_insert("run", "echo", 3, 1_000).expect("insert");
    store.job_insert("done", "echo", 3, 1_000).expect("insert");
    store.job_insert("gone", "echo", 0, 1_000).expect("insert");

    // drive "done" to completed
    loop {
        let Some(job) = store.job_acquire("host:1", 2_000, TTL_MS).expect("acquire") else {
            break;
        };
        match job.id.as_str() {
            "done" => store
                .job_complete("done", "host:1", None, 2_100)
                .expect("complete"),
            "gone" => store
                .job_fail("gone", "host:1", "boom", None, RetryDecision::Dead, 2_100)
                .expect("fail"),
            "run" => {}
            _ => {
                // put the probe jobs back by failing them into retry
                store
                    .job_fail(
                        &job.id,
                        "host:1",
                        "requeue",
                        None,
                        RetryDecision::Retry { delay_s: 60 },
                        2_100,
                    )
                    .expect("fail");
            }
        }
    }

    let counts = store.jobs_counts().expect("counts");
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.total(), 5);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn long_error_and_output_are_clamped() {
    let dir = temp_dir("error_output_clamped");
    let mut store = SqliteStore::open(&dir).expect("open store");

    store.job_insert("job-1", "exit 1", 3, 1_000).expect("insert");
    store
        .job_acquire("host:1", 2_000, TTL_MS)
        .expect("acquire")
        .expect("leased");

    let long_error = "e".repeat(10_000);
    let long_output = "o".repeat(64 * 1024);
    store
        .job_fail(
            "job-1",
            "host:1",
            &long_error,
            Some(&long_output),
            RetryDecision::Retry { delay_s: 1 },
            2_500,
        )
        .expect("fail");

    let job = store.job_get("job-1").expect("get").expect("exists");
    assert_eq!(job.last_error.map(|e| e.len()), Some(400));
    assert_eq!(job.output.map(|o| o.len()), Some(16 * 1024));
    let _ = std::fs::remove_dir_all(&dir);
}
