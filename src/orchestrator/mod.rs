//! Workflow orchestration: stage selection, validation, local execution and
//! batch submission.
//!
//! A run validates every selected stage before any of them executes, then
//! runs them in pipeline order and stops at the first failure. A submission
//! runs the control stages that precede the job locally, hands the job
//! stages to the scheduler as one batch job, and runs the trailing control
//! stages once the job has completed.

mod result;

pub use result::{StageResult, WorkflowResult};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{
    Locus, RunEnvironment, StageContext, StageDescriptor, StagePipeline, StageStatus,
    SubmitPartition, WorkflowMonitor,
};
use crate::scheduler::{JobInvocation, JobScript, JobState, PollConfig, SchedulerClient};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Name of the input acquisition stage, skipped when downloads are disabled.
pub const DOWNLOAD_STAGE: &str = "download";

/// Resolved configuration written next to the job script.
pub const RESOLVED_CONFIG_FILE: &str = "resolved_config.yaml";

pub const JOB_SCRIPT_FILE: &str = "submit_job.sh";

/// Options for a local run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start_from: Option<String>,
    pub stop_after: Option<String>,
    /// Validate and report the selection without executing anything
    pub dry_run: bool,
    /// Only run stages with this locus
    pub locus: Option<Locus>,
}

/// Options for a batch submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub start_from: Option<String>,
    pub stop_after: Option<String>,
    /// Block until the job finishes, then run the trailing control stages
    pub wait: bool,
    /// Program the batch job re-enters
    pub program: PathBuf,
    /// Override for the polling schedule from `monitoring`
    pub poll: Option<PollConfig>,
}

impl SubmitOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            start_from: None,
            stop_after: None,
            wait: true,
            program: program.into(),
            poll: None,
        }
    }
}

/// Drives one configuration through its stage pipeline.
pub struct Orchestrator {
    config: Config,
    pipeline: StagePipeline,
    monitor: WorkflowMonitor,
    run_id: String,
}

impl Orchestrator {
    /// Orchestrator for the stage sequence of the configured model.
    pub fn new(config: Config) -> Result<Self> {
        let pipeline = StagePipeline::for_config(&config)?;
        Ok(Self::with_pipeline(config, pipeline))
    }

    /// Orchestrator over an explicit pipeline.
    pub fn with_pipeline(config: Config, pipeline: StagePipeline) -> Self {
        let run_id = format!(
            "{}_{}_{}",
            config.model,
            config.simulation.coastal_domain,
            Utc::now().format("%Y%m%dT%H%M%S")
        );
        Self {
            config,
            pipeline,
            monitor: WorkflowMonitor::new(),
            run_id,
        }
    }

    /// Resolve `path` and build an orchestrator for it.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::new(Config::from_file(path)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    pub fn monitor(&self) -> &WorkflowMonitor {
        &self.monitor
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Check the prerequisites of every stage in the range.
    pub fn validate(&self, start_from: Option<&str>, stop_after: Option<&str>) -> Result<()> {
        let stages = self.select(start_from, stop_after, None)?;
        self.check(&stages)
    }

    /// Run the selected stages in this process.
    pub fn run(&self, options: &RunOptions) -> WorkflowResult {
        let mut result = WorkflowResult::new(self.run_id.clone());
        if let Err(e) = self.run_stages(options, &mut result) {
            tracing::error!("{}", e);
            result.fail(&e);
        }
        self.complete(result)
    }

    /// Submit the job stages of the selection as one batch job.
    pub fn submit(&self, scheduler: &dyn SchedulerClient, options: &SubmitOptions) -> WorkflowResult {
        let mut result = WorkflowResult::new(self.run_id.clone());
        if let Err(e) = self.submit_stages(scheduler, options, &mut result) {
            tracing::error!("{}", e);
            result.fail(&e);
        }
        self.complete(result)
    }

    fn run_stages(&self, options: &RunOptions, result: &mut WorkflowResult) -> Result<()> {
        let stages = self.select(
            options.start_from.as_deref(),
            options.stop_after.as_deref(),
            options.locus,
        )?;
        tracing::info!(
            "Run {}: {} stage(s) selected for {}",
            self.run_id,
            stages.len(),
            self.config.model
        );
        self.monitor.register(stages.iter().map(|s| s.name()));
        self.check(&stages)?;

        if options.dry_run {
            for stage in &stages {
                tracing::info!("  would run {} ({})", stage.name(), stage.locus());
                self.skip(stage, "dry run", result);
            }
            return Ok(());
        }

        let env = RunEnvironment::build(&self.config);
        self.execute(&stages, &env, result)
    }

    fn submit_stages(
        &self,
        scheduler: &dyn SchedulerClient,
        options: &SubmitOptions,
        result: &mut WorkflowResult,
    ) -> Result<()> {
        let stages = self.select(options.start_from.as_deref(), options.stop_after.as_deref(), None)?;
        self.monitor.register(stages.iter().map(|s| s.name()));
        self.check(&stages)?;

        let partition = SubmitPartition::new(&stages);
        let env = RunEnvironment::build(&self.config);

        self.execute(&partition.pre_job, &env, result)?;
        if !partition.has_job() {
            tracing::info!("No job stages selected; nothing to submit");
            return self.execute(&partition.post_job, &env, result);
        }

        let job_id = self.submit_job(scheduler, options, &partition.job)?;
        result.job_id = Some(job_id.clone());
        for stage in &partition.job {
            self.monitor.start(stage.name());
        }

        if !options.wait {
            tracing::info!("Job {} submitted; not waiting for completion", job_id);
            for stage in &partition.post_job {
                self.skip(stage, format!("waits for job {job_id}"), result);
            }
            return Ok(());
        }

        let poll = options
            .poll
            .clone()
            .unwrap_or_else(|| PollConfig::from(&self.config.monitoring));
        let started = Utc::now();
        let record = scheduler.wait(&job_id, &poll)?;

        if record.state != JobState::Completed {
            for stage in &partition.job {
                self.monitor.finish(stage.name(), StageStatus::Failed);
                result.record(StageResult::failed(
                    stage.name(),
                    started,
                    format!("batch job {} ended {}", job_id, record.state),
                ));
            }
            for stage in &partition.post_job {
                self.skip(stage, format!("job {job_id} did not complete"), result);
            }
            return Err(Error::JobFailed {
                job_id,
                state: record.state,
            });
        }

        for stage in &partition.job {
            self.monitor.finish(stage.name(), StageStatus::Completed);
            let mut output = crate::pipeline::Payload::new();
            output.insert("job_id".into(), job_id.clone().into());
            result.record(StageResult::completed(stage.name(), started, output));
        }
        self.execute(&partition.post_job, &env, result)
    }

    /// Write the configuration snapshot and job script, then submit.
    fn submit_job(
        &self,
        scheduler: &dyn SchedulerClient,
        options: &SubmitOptions,
        job: &[&StageDescriptor],
    ) -> Result<String> {
        let (Some(first), Some(last)) = (job.first(), job.last()) else {
            return Err(Error::Submission("no job stages to submit".to_string()));
        };

        let work_dir = &self.config.paths.work_dir;
        std::fs::create_dir_all(work_dir)?;

        let snapshot = work_dir.join(RESOLVED_CONFIG_FILE);
        let yaml = self
            .config
            .to_yaml()
            .map_err(|e| Error::Submission(format!("cannot serialize configuration: {e}")))?;
        std::fs::write(&snapshot, yaml)?;

        let invocation = JobInvocation {
            program: options.program.clone(),
            config: snapshot,
            start_from: first.name().to_string(),
            stop_after: last.name().to_string(),
        };
        let script = work_dir.join(JOB_SCRIPT_FILE);
        JobScript::new(&self.config, &invocation).write(&script)?;

        tracing::info!(
            "Submitting {} job stage(s) ({} .. {}) via {}",
            job.len(),
            first.name(),
            last.name(),
            script.display()
        );
        scheduler.submit(&script)
    }

    fn select(
        &self,
        start_from: Option<&str>,
        stop_after: Option<&str>,
        locus: Option<Locus>,
    ) -> Result<Vec<&StageDescriptor>> {
        let range = self.pipeline.slice(start_from, stop_after)?;
        Ok(range
            .iter()
            .filter(|s| locus.map_or(true, |l| s.locus() == l))
            .collect())
    }

    fn is_disabled(&self, stage: &StageDescriptor) -> bool {
        stage.name() == DOWNLOAD_STAGE && !self.config.download.enabled
    }

    /// Collect prerequisite failures of every enabled stage.
    fn check(&self, stages: &[&StageDescriptor]) -> Result<()> {
        let errors: Vec<String> = stages
            .iter()
            .filter(|s| !self.is_disabled(s))
            .flat_map(|s| s.validate(&self.config))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::StageValidation(errors))
        }
    }

    /// Run stages in order, stopping at the first failure.
    fn execute(&self, stages: &[&StageDescriptor], env: &RunEnvironment, result: &mut WorkflowResult) -> Result<()> {
        for stage in stages {
            if self.is_disabled(stage) {
                self.skip(stage, "download disabled", result);
                continue;
            }

            self.monitor.start(stage.name());
            let started = Utc::now();
            let ctx = StageContext {
                config: &self.config,
                env,
                monitor: &self.monitor,
                stage: stage.name(),
            };

            match stage.run(&ctx) {
                Ok(output) => {
                    self.monitor.finish(stage.name(), StageStatus::Completed);
                    result.record(StageResult::completed(stage.name(), started, output));
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    self.monitor.finish(stage.name(), StageStatus::Failed);
                    result.record(StageResult::failed(stage.name(), started, message.clone()));
                    return Err(Error::StageExecution {
                        stage: stage.name().to_string(),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    fn skip(&self, stage: &StageDescriptor, reason: impl Into<String>, result: &mut WorkflowResult) {
        self.monitor.finish(stage.name(), StageStatus::Skipped);
        result.record(StageResult::skipped(stage.name(), reason));
    }

    fn complete(&self, mut result: WorkflowResult) -> WorkflowResult {
        result.finalize();
        tracing::info!("{}", result);

        if let Some(dir) = &self.config.monitoring.result_dir {
            let path = dir.join(format!("{}.json", result.run_id));
            if let Err(e) = result.save(&path) {
                tracing::warn!("Could not save run result to {}: {:#}", path.display(), e);
            }
        }
        result
    }
}

/// Resolve `path` and run it; resolution failures become a rejected result.
pub fn run_workflow(path: &Path, options: &RunOptions) -> WorkflowResult {
    match Orchestrator::from_path(path) {
        Ok(orchestrator) => orchestrator.run(options),
        Err(e) => rejected(path, &e),
    }
}

/// Resolve `path` and submit it; resolution failures become a rejected result.
pub fn submit_workflow(path: &Path, scheduler: &dyn SchedulerClient, options: &SubmitOptions) -> WorkflowResult {
    match Orchestrator::from_path(path) {
        Ok(orchestrator) => orchestrator.submit(scheduler, options),
        Err(e) => rejected(path, &e),
    }
}

fn rejected(path: &Path, error: &Error) -> WorkflowResult {
    tracing::error!("{}", error);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    WorkflowResult::rejected(format!("{}_{}", stem, Utc::now().format("%Y%m%dT%H%M%S")), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::pipeline::{Payload, Stage};
    use crate::scheduler::testing::{fast_poll, ScriptedScheduler};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    fn config(root: &Path, extra: &str) -> Config {
        Config::from_yaml(&format!(
            r#"
simulation:
  start_date: 2021-06-11
  duration_hours: 3
  coastal_domain: hawaii
  meteo_source: nwm_ana
paths:
  root_dir: {}
{extra}
"#,
            root.display()
        ))
        .unwrap()
    }

    fn recording(name: &str, locus: Locus, log: &Log) -> StageDescriptor {
        let log = Arc::clone(log);
        StageDescriptor::new(
            name,
            locus,
            Arc::new(move |ctx: &StageContext<'_>| -> anyhow::Result<Payload> {
                log.lock().unwrap().push(ctx.stage.to_string());
                Ok(Payload::new())
            }),
        )
    }

    fn failing(name: &str, log: &Log) -> StageDescriptor {
        let log = Arc::clone(log);
        StageDescriptor::new(
            name,
            Locus::Control,
            Arc::new(move |ctx: &StageContext<'_>| -> anyhow::Result<Payload> {
                log.lock().unwrap().push(ctx.stage.to_string());
                anyhow::bail!("solver diverged")
            }),
        )
    }

    struct Unready;

    impl Stage for Unready {
        fn validate(&self, _config: &Config) -> Vec<String> {
            vec!["mesh file missing".to_string()]
        }

        fn run(&self, _ctx: &StageContext<'_>) -> anyhow::Result<Payload> {
            panic!("must not run")
        }
    }

    fn ran(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// download, prep, a (job), obs, b (job), plot
    fn submit_pipeline(log: &Log) -> StagePipeline {
        StagePipeline::new(vec![
            recording("download", Locus::Control, log),
            recording("prep", Locus::Control, log),
            recording("a", Locus::Job, log),
            recording("obs", Locus::Control, log),
            recording("b", Locus::Job, log),
            recording("plot", Locus::Control, log),
        ])
        .unwrap()
    }

    #[test]
    fn test_run_stops_at_first_failure() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let pipeline = StagePipeline::new(vec![
            recording("s1", Locus::Control, &log),
            failing("s2", &log),
            recording("s3", Locus::Control, &log),
        ])
        .unwrap();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), pipeline);

        let result = orchestrator.run(&RunOptions::default());

        assert_eq!(ran(&log), vec!["s1", "s2"]);
        assert!(!result.success);
        assert_eq!(result.stages_completed, vec!["s1"]);
        assert_eq!(result.stages_failed, vec!["s2"]);
        assert_eq!(result.failure, Some(FailureKind::Runtime));
        assert_eq!(result.exit_code(), 2);
        assert!(result.errors[0].contains("solver diverged"));
        assert_eq!(orchestrator.monitor().status("s3"), Some(StageStatus::Pending));
    }

    #[test]
    fn test_validation_failure_runs_nothing() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let pipeline = StagePipeline::new(vec![
            recording("s1", Locus::Control, &log),
            StageDescriptor::new("s2", Locus::Job, Arc::new(Unready)),
        ])
        .unwrap();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), pipeline);

        let result = orchestrator.run(&RunOptions::default());

        assert!(ran(&log).is_empty());
        assert_eq!(result.failure, Some(FailureKind::Configuration));
        assert_eq!(result.errors, vec!["s2: mesh file missing"]);

        // The unready stage lies outside this range
        let result = orchestrator.run(&RunOptions {
            stop_after: Some("s1".into()),
            ..RunOptions::default()
        });
        assert!(result.success);
        assert_eq!(ran(&log), vec!["s1"]);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));

        let result = orchestrator.run(&RunOptions {
            dry_run: true,
            ..RunOptions::default()
        });

        assert!(result.success);
        assert!(ran(&log).is_empty());
        assert_eq!(result.stages_skipped.len(), 6);
    }

    #[test]
    fn test_download_disabled_is_skipped() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let pipeline = StagePipeline::new(vec![
            StageDescriptor::new("download", Locus::Control, Arc::new(Unready)),
            recording("prep", Locus::Control, &log),
        ])
        .unwrap();
        let orchestrator =
            Orchestrator::with_pipeline(config(root.path(), "download:\n  enabled: false"), pipeline);

        let result = orchestrator.run(&RunOptions::default());

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.stages_skipped, vec!["download"]);
        assert_eq!(ran(&log), vec!["prep"]);
    }

    #[test]
    fn test_locus_filter() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));

        let result = orchestrator.run(&RunOptions {
            start_from: Some("a".into()),
            stop_after: Some("b".into()),
            locus: Some(Locus::Job),
            ..RunOptions::default()
        });

        assert!(result.success);
        assert_eq!(ran(&log), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_stage_is_configuration_error() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));

        let result = orchestrator.run(&RunOptions {
            start_from: Some("bogus".into()),
            ..RunOptions::default()
        });

        assert_eq!(result.exit_code(), 1);
        assert!(result.errors[0].contains("bogus"));
        assert!(ran(&log).is_empty());
    }

    #[test]
    fn test_submit_waits_then_runs_post_job() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));
        let scheduler = ScriptedScheduler::new(&[JobState::Pending, JobState::Running, JobState::Completed]);
        let options = SubmitOptions {
            poll: Some(fast_poll(5)),
            ..SubmitOptions::new("/opt/bin/coastal-calib")
        };

        let result = orchestrator.submit(&scheduler, &options);

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.job_id.as_deref(), Some("4242"));
        // Job stages run inside the allocation, not here
        assert_eq!(ran(&log), vec!["download", "prep", "obs", "plot"]);
        assert_eq!(result.stages_completed, vec!["download", "prep", "obs", "a", "b", "plot"]);
        assert_eq!(scheduler.queries(), 3);

        let work_dir = &orchestrator.config().paths.work_dir;
        let script = std::fs::read_to_string(work_dir.join(JOB_SCRIPT_FILE)).unwrap();
        assert!(script.contains("--start-from a --stop-after b --locus job"));
        assert!(script.contains(RESOLVED_CONFIG_FILE));

        let snapshot = Config::from_file(work_dir.join(RESOLVED_CONFIG_FILE)).unwrap();
        assert_eq!(snapshot.paths.work_dir, *work_dir);
    }

    #[test]
    fn test_submit_job_failure_skips_post_job() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));
        let scheduler = ScriptedScheduler::new(&[JobState::Failed]);
        let options = SubmitOptions {
            poll: Some(fast_poll(5)),
            ..SubmitOptions::new("coastal-calib")
        };

        let result = orchestrator.submit(&scheduler, &options);

        assert!(!result.success);
        assert_eq!(result.exit_code(), 4);
        assert_eq!(result.stages_failed, vec!["a", "b"]);
        assert_eq!(result.stages_skipped, vec!["plot"]);
        assert!(!ran(&log).contains(&"plot".to_string()));
    }

    #[test]
    fn test_submit_rejected_by_scheduler() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));
        let scheduler = ScriptedScheduler {
            reject_submit: true,
            ..ScriptedScheduler::new(&[])
        };

        let result = orchestrator.submit(&scheduler, &SubmitOptions::new("coastal-calib"));

        assert_eq!(result.exit_code(), 3);
        assert!(result.job_id.is_none());
        assert_eq!(scheduler.queries(), 0);
        assert_eq!(ran(&log), vec!["download", "prep", "obs"]);
    }

    #[test]
    fn test_submit_without_waiting() {
        let root = TempDir::new().unwrap();
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(config(root.path(), ""), submit_pipeline(&log));
        let scheduler = ScriptedScheduler::new(&[]);
        let options = SubmitOptions {
            wait: false,
            ..SubmitOptions::new("coastal-calib")
        };

        let result = orchestrator.submit(&scheduler, &options);

        assert!(result.success);
        assert_eq!(result.job_id.as_deref(), Some("4242"));
        assert_eq!(scheduler.queries(), 0);
        assert_eq!(result.stages_skipped, vec!["plot"]);
        assert_eq!(scheduler.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_result_persisted_to_result_dir() {
        let root = TempDir::new().unwrap();
        let results = root.path().join("results");
        let log = Log::default();
        let orchestrator = Orchestrator::with_pipeline(
            config(root.path(), &format!("monitoring:\n  result_dir: {}", results.display())),
            submit_pipeline(&log),
        );

        let result = orchestrator.run(&RunOptions::default());

        let saved = results.join(format!("{}.json", result.run_id));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(saved).unwrap()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["stages_completed"].as_array().unwrap().len(), 6);
        assert!(result.run_id.starts_with("schism_hawaii_"));
    }

    #[test]
    fn test_run_workflow_missing_file() {
        let root = TempDir::new().unwrap();
        let result = run_workflow(&root.path().join("absent.yaml"), &RunOptions::default());
        assert_eq!(result.exit_code(), 1);
        assert!(result.run_id.starts_with("absent_"));
    }
}
