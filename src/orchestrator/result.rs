//! Run outcome records.

use crate::error::{Error, FailureKind};
use crate::pipeline::{Payload, StageStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Payload::is_empty")]
    pub output: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    pub fn completed(name: &str, started_at: DateTime<Utc>, output: Payload) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Completed,
            started_at,
            finished_at: Utc::now(),
            output,
            error: None,
        }
    }

    pub fn failed(name: &str, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Failed,
            started_at,
            finished_at: Utc::now(),
            output: Payload::new(),
            error: Some(error.into()),
        }
    }

    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut output = Payload::new();
        output.insert("reason".into(), reason.into().into());
        Self {
            name: name.to_string(),
            status: StageStatus::Skipped,
            started_at: now,
            finished_at: now,
            output,
            error: None,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub success: bool,
    pub job_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub stages_completed: Vec<String>,
    pub stages_failed: Vec<String>,
    pub stages_skipped: Vec<String>,
    pub stages: Vec<StageResult>,
    /// Stage outputs by stage name
    pub outputs: BTreeMap<String, Payload>,
    pub errors: Vec<String>,
    pub failure: Option<FailureKind>,
}

impl WorkflowResult {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            success: true,
            job_id: None,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            stages_completed: Vec::new(),
            stages_failed: Vec::new(),
            stages_skipped: Vec::new(),
            stages: Vec::new(),
            outputs: BTreeMap::new(),
            errors: Vec::new(),
            failure: None,
        }
    }

    /// A finalized result for a run that never got past validation.
    pub fn rejected(run_id: impl Into<String>, error: &Error) -> Self {
        let mut result = Self::new(run_id);
        result.fail(error);
        result.finalize();
        result
    }

    pub fn record(&mut self, stage: StageResult) {
        match stage.status {
            StageStatus::Completed => self.stages_completed.push(stage.name.clone()),
            StageStatus::Failed => self.stages_failed.push(stage.name.clone()),
            StageStatus::Skipped => self.stages_skipped.push(stage.name.clone()),
            StageStatus::Pending | StageStatus::Running => {}
        }
        if stage.status == StageStatus::Completed && !stage.output.is_empty() {
            self.outputs.insert(stage.name.clone(), stage.output.clone());
        }
        self.stages.push(stage);
    }

    /// Record a fatal error. The first error decides the failure kind.
    pub fn fail(&mut self, error: &Error) {
        self.errors.extend(error.messages());
        self.failure.get_or_insert(error.kind());
        self.success = false;
    }

    pub fn finalize(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_seconds = Some((end - self.start_time).num_milliseconds() as f64 / 1000.0);
        self.success = self.failure.is_none() && self.stages_failed.is_empty();
    }

    pub fn exit_code(&self) -> i32 {
        match self.failure {
            Some(kind) => kind.exit_code(),
            None if self.success => 0,
            None => FailureKind::Runtime.exit_code(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        tracing::info!("Run result saved to {}", path.display());
        Ok(())
    }
}

impl fmt::Display for WorkflowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} {} | completed: {} | failed: {} | skipped: {}",
            self.run_id,
            if self.success { "succeeded" } else { "failed" },
            self.stages_completed.len(),
            self.stages_failed.len(),
            self.stages_skipped.len(),
        )?;
        if let Some(job_id) = &self.job_id {
            write!(f, " | job: {job_id}")?;
        }
        if let Some(duration) = self.duration_seconds {
            write!(f, " | {duration:.1}s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_buckets_stages() {
        let mut result = WorkflowResult::new("schism_hawaii_20210611T000000");
        let mut output = Payload::new();
        output.insert("files".into(), 3.into());

        result.record(StageResult::completed("download", Utc::now(), output));
        result.record(StageResult::skipped("schism_obs", "dry run"));
        result.record(StageResult::failed("schism_run", Utc::now(), "exit 1"));
        result.finalize();

        assert_eq!(result.stages_completed, vec!["download"]);
        assert_eq!(result.stages_skipped, vec!["schism_obs"]);
        assert_eq!(result.stages_failed, vec!["schism_run"]);
        assert!(result.outputs.contains_key("download"));
        assert!(!result.success);
    }

    #[test]
    fn test_first_failure_kind_wins() {
        let mut result = WorkflowResult::new("run");
        result.fail(&Error::Submission("queue closed".into()));
        result.fail(&Error::StageExecution {
            stage: "x".into(),
            message: "boom".into(),
        });
        result.finalize();

        assert_eq!(result.failure, Some(FailureKind::Submission));
        assert_eq!(result.exit_code(), 3);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results").join("nested").join("run.json");

        let mut result = WorkflowResult::new("run");
        result.finalize();
        result.save(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["run_id"], "run");
        assert_eq!(json["success"], true);
        assert!(json["duration_seconds"].is_number());
    }

    #[test]
    fn test_rejected_is_finalized() {
        let result = WorkflowResult::rejected("run", &Error::ConfigValidation(vec!["a".into(), "b".into()]));
        assert!(!result.success);
        assert_eq!(result.errors, vec!["a", "b"]);
        assert_eq!(result.exit_code(), 1);
        assert!(result.end_time.is_some());
    }
}
