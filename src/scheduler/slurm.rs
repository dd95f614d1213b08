//! SLURM client built on `sbatch`, `sacct`, `squeue` and `scancel`.

use super::{JobState, SchedulerClient};
use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Command, Output};

const SACCT_FORMAT: &str = "JobID,JobName,State,NodeList,ExitCode,Elapsed,Reason";
const SQUEUE_FORMAT: &str = "%i|%j|%T|%N|%r";

/// Talks to SLURM through its command line tools.
#[derive(Debug, Clone, Default)]
pub struct SlurmClient {
    /// Restrict queue listings to this user
    user: Option<String>,
}

impl SlurmClient {
    pub fn new(user: Option<String>) -> Self {
        Self { user }
    }

    fn run(&self, program: &str, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!("Running {} {}", program, args.join(" "));
        cmd.output()
            .map_err(|e| Error::Scheduler(format!("cannot run {program}: {e}")))
    }

    fn query_sacct(&self, job_id: &str) -> Result<Option<JobState>> {
        let format = format!("--format={SACCT_FORMAT}");
        let output = self.run(
            "sacct",
            &["-j", job_id, &format, "--noheader", "--parsable2"],
            None,
        )?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_state_line(&String::from_utf8_lossy(&output.stdout), job_id))
    }

    fn query_squeue(&self, job_id: &str) -> Result<Option<JobState>> {
        let format = format!("--format={SQUEUE_FORMAT}");
        let mut args = vec!["-j", job_id, format.as_str(), "--noheader"];
        if let Some(user) = &self.user {
            args.extend(["-u", user.as_str()]);
        }
        let output = self.run("squeue", &args, None)?;
        if !output.status.success() {
            // squeue rejects ids that have left the queue
            return Ok(None);
        }
        Ok(parse_state_line(&String::from_utf8_lossy(&output.stdout), job_id))
    }
}

impl SchedulerClient for SlurmClient {
    fn submit(&self, script: &Path) -> Result<String> {
        let script_arg = script.to_string_lossy();
        let output = self
            .run("sbatch", &[script_arg.as_ref()], script.parent())
            .map_err(|e| Error::Submission(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Submission(format!(
                "sbatch exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let job_id = parse_submission(&stdout).ok_or_else(|| {
            Error::Submission(format!("unexpected sbatch output: {}", stdout.trim()))
        })?;
        tracing::info!("Submitted batch job {}", job_id);
        Ok(job_id)
    }

    fn status(&self, job_id: &str) -> Result<JobState> {
        reconcile(self.query_sacct(job_id), || self.query_squeue(job_id))
    }

    fn cancel(&self, job_id: &str) -> Result<()> {
        let output = self.run("scancel", &[job_id], None)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scheduler(format!(
                "scancel {job_id} failed: {}",
                stderr.trim()
            )));
        }
        tracing::info!("Cancelled job {}", job_id);
        Ok(())
    }
}

/// Map a SLURM state name onto [`JobState`].
pub fn map_slurm_state(state: &str) -> JobState {
    let state = state.trim().to_ascii_uppercase();
    // sacct reports e.g. "CANCELLED by 1234"
    if state.starts_with("CANCELLED") {
        return JobState::Cancelled;
    }
    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "SUSPENDED" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => JobState::Failed,
        _ => JobState::Unknown,
    }
}

/// Extract the job id from `sbatch` output.
pub fn parse_submission(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if let Some(rest) = line.trim().strip_prefix("Submitted batch job") {
            let id = rest.trim();
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                return Some(id.to_string());
            }
        }
    }
    // `sbatch --parsable` prints "<id>[;cluster]"
    let first = stdout.trim().split(';').next()?.trim();
    (!first.is_empty() && first.chars().all(|c| c.is_ascii_digit())).then(|| first.to_string())
}

/// Combine accounting and queue answers into one state.
///
/// Accounting is trusted only for terminal states, since it lags behind the
/// queue for live jobs. The queue only knows live jobs, so when it has no
/// entry the accounting answer stands.
fn reconcile(
    accounted: Result<Option<JobState>>,
    queued: impl FnOnce() -> Result<Option<JobState>>,
) -> Result<JobState> {
    if let Ok(Some(state)) = &accounted {
        if state.is_terminal() {
            return Ok(*state);
        }
    }

    match queued() {
        Ok(Some(state)) => Ok(state),
        Ok(None) => Ok(accounted.ok().flatten().unwrap_or(JobState::Unknown)),
        Err(e) => match accounted {
            Ok(state) => Ok(state.unwrap_or(JobState::Unknown)),
            Err(_) => Err(e),
        },
    }
}

/// State of `job_id` from `|`-separated `id|name|state|...` rows, as printed
/// by `sacct --parsable2` and by `squeue` with [`SQUEUE_FORMAT`]. Rows of
/// other ids, job steps included, are ignored.
pub fn parse_state_line(stdout: &str, job_id: &str) -> Option<JobState> {
    stdout.lines().find_map(|line| {
        let mut fields = line.split('|');
        let id = fields.next()?.trim();
        let _name = fields.next()?;
        let state = fields.next()?;
        (id == job_id).then(|| map_slurm_state(state))
    })
}
