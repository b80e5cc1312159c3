#![forbid(unsafe_code)]

pub mod config;

pub mod model {
    /// Lifecycle state of a job. `Pending` is initial; `Completed` and `Dead`
    /// are terminal; `Failed` always either re-enters `Processing` once its
    /// backoff elapses or is promoted to `Dead`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum JobState {
        Pending,
        Processing,
        Completed,
        Failed,
        Dead,
    }

    impl JobState {
        pub const ALL: [JobState; 5] = [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                JobState::Pending => "pending",
                JobState::Processing => "processing",
                JobState::Completed => "completed",
                JobState::Failed => "failed",
                JobState::Dead => "dead",
            }
        }

        pub fn parse(raw: &str) -> Option<Self> {
            match raw.trim().to_ascii_lowercase().as_str() {
                "pending" => Some(JobState::Pending),
                "processing" => Some(JobState::Processing),
                "completed" => Some(JobState::Completed),
                "failed" => Some(JobState::Failed),
                "dead" => Some(JobState::Dead),
                _ => None,
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(self, JobState::Completed | JobState::Dead)
        }
    }
}

pub mod policy {
    /// Delays are clamped so degenerate configs (`backoff-base=0`, huge
    /// exponents) cannot produce a zero or multi-day wait.
    pub const MIN_RETRY_DELAY_S: u64 = 1;
    pub const MAX_RETRY_DELAY_S: u64 = 86_400;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RetryDecision {
        Retry { delay_s: u64 },
        Dead,
    }

    /// Map a failed attempt to its verdict. `attempts_after_failure` is the
    /// post-increment attempt count, so a job with `max_retries = k` gets
    /// `k + 1` executions before it goes dead, and the first retry waits
    /// `backoff_base ^ 1` seconds.
    pub fn decide(attempts_after_failure: u32, max_retries: u32, backoff_base: u32) -> RetryDecision {
        if attempts_after_failure > max_retries {
            return RetryDecision::Dead;
        }
        let base = u64::from(backoff_base.max(1));
        let delay_s = base
            .saturating_pow(attempts_after_failure)
            .clamp(MIN_RETRY_DELAY_S, MAX_RETRY_DELAY_S);
        RetryDecision::Retry { delay_s }
    }
}

#[cfg(test)]
mod tests {
    use super::model::JobState;
    use super::policy::{MAX_RETRY_DELAY_S, RetryDecision, decide};

    #[test]
    fn job_state_round_trips_through_text() {
        for state in JobState::ALL {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse(" PENDING "), Some(JobState::Pending));
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn terminal_states_are_completed_and_dead() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }

    #[test]
    fn decide_returns_exponential_delays_until_exhausted() {
        assert_eq!(decide(1, 3, 2), RetryDecision::Retry { delay_s: 2 });
        assert_eq!(decide(2, 3, 2), RetryDecision::Retry { delay_s: 4 });
        assert_eq!(decide(3, 3, 2), RetryDecision::Retry { delay_s: 8 });
        assert_eq!(decide(4, 3, 2), RetryDecision::Dead);
    }

    #[test]
    fn decide_allows_exactly_one_execution_when_retries_disabled() {
        assert_eq!(decide(1, 0, 2), RetryDecision::Dead);
    }

    #[test]
    fn decide_clamps_degenerate_configs() {
        // base 0 is treated as 1 and still waits at least a second.
        assert_eq!(decide(1, 5, 0), RetryDecision::Retry { delay_s: 1 });
        // huge exponents saturate at the 24h ceiling instead of overflowing.
        assert_eq!(
            decide(60, 100, 10),
            RetryDecision::Retry {
                delay_s: MAX_RETRY_DELAY_S
            }
        );
    }
}
