//! Batch scheduler integration: job submission, status polling and cancellation.

mod script;
mod slurm;

pub use script::{JobInvocation, JobScript};
pub use slurm::SlurmClient;

use crate::config::MonitoringConfig;
use crate::error::Result;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    /// Whether the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job as last seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    /// Status queries issued so far
    pub polls: u32,
}

/// Polling schedule for [`SchedulerClient::wait`].
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    /// Consecutive `Unknown` answers after which the job is treated as failed
    pub unknown_threshold: u32,
}

impl From<&MonitoringConfig> for PollConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            max_interval: Duration::from_secs(config.max_poll_interval_secs),
            unknown_threshold: config.unknown_poll_threshold,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

/// Client for a batch scheduler.
pub trait SchedulerClient: Send + Sync {
    /// Submit a job script; returns the scheduler's job identifier.
    fn submit(&self, script: &Path) -> Result<String>;

    /// Current state of a job.
    fn status(&self, job_id: &str) -> Result<JobState>;

    /// Request cancellation of a job.
    fn cancel(&self, job_id: &str) -> Result<()>;

    /// Block until the job reaches a terminal state.
    ///
    /// The polling interval doubles after every query up to
    /// `max_interval`. A job that stays `Unknown` for `unknown_threshold`
    /// consecutive polls is reported as `Failed`. Failed queries count as
    /// `Unknown`. No query is issued after the first terminal answer.
    fn wait(&self, job_id: &str, poll: &PollConfig) -> Result<JobRecord> {
        let mut interval = poll.interval;
        let mut last_state: Option<JobState> = None;
        let mut unknown_streak = 0u32;
        let mut polls = 0u32;

        loop {
            let state = match self.status(job_id) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Status query for job {} failed: {}", job_id, e);
                    JobState::Unknown
                }
            };
            polls += 1;

            if last_state != Some(state) {
                tracing::info!("Job {} is {}", job_id, state);
                last_state = Some(state);
            }

            if state.is_terminal() {
                return Ok(JobRecord {
                    job_id: job_id.to_string(),
                    state,
                    polls,
                });
            }

            if state == JobState::Unknown {
                unknown_streak += 1;
                if unknown_streak >= poll.unknown_threshold.max(1) {
                    tracing::warn!(
                        "Job {} unknown to the scheduler for {} consecutive polls; treating as failed",
                        job_id,
                        unknown_streak
                    );
                    return Ok(JobRecord {
                        job_id: job_id.to_string(),
                        state: JobState::Failed,
                        polls,
                    });
                }
            } else {
                unknown_streak = 0;
            }

            std::thread::sleep(interval);
            interval = (interval * 2).min(poll.max_interval.max(poll.interval));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{fast_poll, ScriptedScheduler};
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
    }

    #[test]
    fn test_wait_stops_at_first_terminal_state() {
        let scheduler = ScriptedScheduler::new(&[
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Running,
        ]);

        let record = scheduler.wait("4242", &fast_poll(5)).unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.polls, 3);
        assert_eq!(scheduler.queries(), 3);
    }

    #[test]
    fn test_wait_gives_up_on_persistent_unknown() {
        let scheduler = ScriptedScheduler::new(&[JobState::Running]);

        let record = scheduler.wait("4242", &fast_poll(3)).unwrap();
        assert_eq!(record.state, JobState::Failed);
        // One running answer, then three unknowns
        assert_eq!(scheduler.queries(), 4);
    }

    #[test]
    fn test_unknown_streak_resets() {
        let scheduler = ScriptedScheduler::new(&[
            JobState::Unknown,
            JobState::Unknown,
            JobState::Running,
            JobState::Unknown,
            JobState::Unknown,
            JobState::Cancelled,
        ]);

        let record = scheduler.wait("4242", &fast_poll(3)).unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.polls, 6);
    }

    #[test]
    fn test_poll_config_from_monitoring() {
        let poll = PollConfig::default();
        assert_eq!(poll.interval, Duration::from_secs(30));
        assert_eq!(poll.max_interval, Duration::from_secs(300));
        assert_eq!(poll.unknown_threshold, 5);
    }
}
