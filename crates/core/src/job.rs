//! Job row types and related definitions.

use serde::{Deserialize, Serialize};

/// The state of a job.
///
/// `Failed` is part of the persisted state set and accepted by list
/// filters, but the engine returns retryable failures to `Pending`; only
/// databases written by older tooling still contain `failed` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for claim once `next_run_at` has passed.
    Pending,
    /// Claimed by a worker holding a live lease.
    Running,
    /// Terminal: the command exited 0.
    Completed,
    /// Legacy retry-wait state, never produced by this engine.
    Failed,
    /// Terminal: retries exhausted, quarantined in the dead-letter queue.
    Dlq,
}

impl JobState {
    /// Canonical lowercase name, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
        }
    }

    /// All states, in lifecycle order. Used by the status listing.
    pub const ALL: [JobState; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Dlq,
    ];
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dlq" => Ok(Self::Dlq),
            other => Err(crate::error::QueueError::InvalidInput(format!(
                "unknown job state '{other}'"
            ))),
        }
    }
}

/// A job row.
///
/// `attempts` counts completed execution attempts, success or failure; it
/// moves only when a worker settles, never at claim time. `next_run_at` is
/// the sole scheduling key, ties broken by ascending `id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Monotonically assigned identity.
    pub id: i64,
    /// Opaque shell string handed to the executor.
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    /// Upper bound on retryable failures before the DLQ transition.
    pub max_retries: i64,
    /// Earliest unix second at which the job is eligible for claim.
    pub next_run_at: i64,
    /// Worker currently holding the lease, if any.
    pub claimed_by: Option<String>,
    /// Unix second the current lease began.
    pub claimed_at: Option<i64>,
    /// Unix second at which the lease expires and the job is reclaimable.
    pub lease_deadline: Option<i64>,
    /// Short diagnostic from the most recent failure.
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Dlq)
    }
}

/// A registered worker row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub pid: i64,
    pub started_at: i64,
    pub last_heartbeat: i64,
}

/// Get current unix timestamp in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_round_trip() {
        for state in JobState::ALL {
            let parsed = JobState::from_str(state.as_str()).unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_state_parse_is_case_insensitive() {
        assert_eq!(JobState::from_str("Pending").unwrap(), JobState::Pending);
        assert_eq!(JobState::from_str(" DLQ ").unwrap(), JobState::Dlq);
    }

    #[test]
    fn test_state_parse_rejects_unknown() {
        assert!(JobState::from_str("zombie").is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JobState::Dlq.to_string(), "dlq");
        assert_eq!(JobState::Running.to_string(), "running");
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&JobState::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobState::Completed);
    }

    #[test]
    fn test_unix_now_is_reasonable() {
        // After 2020-01-01.
        assert!(unix_now() > 1577836800);
    }

    #[test]
    fn test_terminal_states() {
        let mut job = Job {
            id: 1,
            command: "true".to_string(),
            state: JobState::Completed,
            attempts: 1,
            max_retries: 3,
            next_run_at: 0,
            claimed_by: None,
            claimed_at: None,
            lease_deadline: None,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(job.is_terminal());
        job.state = JobState::Dlq;
        assert!(job.is_terminal());
        job.state = JobState::Pending;
        assert!(!job.is_terminal());
    }
}
