//! Concrete stages: input download and external stage scripts.

use super::stage::{Payload, Stage, StageContext};
use crate::config::{BoundarySource, Config, ModelConfig};
use crate::download::sources::{meteo_dir, streamflow_dir};
use crate::download::{DownloadOptions, DownloadRequest, Downloader, StoreRegistry, DEFAULT_REGION};
use anyhow::Context;
use object_store::ObjectStore;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Upper bound for one artifact written by a stage script.
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 50 * 1024 * 1024 * 1024;

const STDERR_TAIL_LINES: usize = 20;

/// Fetches forcing, streamflow and boundary inputs for the run window.
#[derive(Clone)]
pub struct DownloadStage {
    region: String,
    stores: Vec<(String, Arc<dyn ObjectStore>)>,
}

impl DownloadStage {
    pub fn new() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            stores: Vec::new(),
        }
    }

    /// Serve `bucket` from `store` instead of the public S3 bucket.
    pub fn with_store(mut self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.push((bucket.into(), store));
        self
    }

    fn downloader(&self, config: &Config) -> Downloader {
        let registry = self
            .stores
            .iter()
            .fold(StoreRegistry::anonymous(self.region.clone()), |registry, (bucket, store)| {
                registry.with_store(bucket.clone(), Arc::clone(store))
            });
        Downloader::new(registry, DownloadOptions::from(&config.download))
    }
}

impl Default for DownloadStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for DownloadStage {
    fn validate(&self, config: &Config) -> Vec<String> {
        let request = DownloadRequest::from_config(config);
        match self.downloader(config).plan(&request) {
            Ok(_) => Vec::new(),
            Err(e) => match e {
                crate::download::DownloadError::InvalidDateRange(errors) => errors,
                other => vec![other.to_string()],
            },
        }
    }

    fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<Payload> {
        let request = DownloadRequest::from_config(ctx.config);
        let downloader = self.downloader(ctx.config);
        ctx.monitor.substep(
            ctx.stage,
            format!("fetching {} for {}", request.range, request.domain),
        );

        let runtime = crate::build_runtime(None)?;
        let results = runtime.block_on(downloader.download(&request))?;

        for (kind, result) in [
            ("meteo", &results.meteo),
            ("hydro", &results.hydro),
            ("coastal", &results.coastal),
        ] {
            if result.total_files > 0 {
                ctx.monitor.substep(
                    ctx.stage,
                    format!(
                        "{kind}: {}/{} available, {} failed",
                        result.successful + result.skipped,
                        result.total_files,
                        result.failed
                    ),
                );
            }
        }

        match serde_json::to_value(&results)? {
            Value::Object(payload) => Ok(payload),
            other => Ok(Payload::from_iter([("results".to_string(), other)])),
        }
    }
}

/// Extra prerequisite checks of a script stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCheck {
    /// Parameter templates directory present
    ParmDir,
    /// Boundary inputs present for the configured source
    BoundaryInputs,
    /// Forcing pre-staged when downloads are disabled
    StagedForcing,
    /// Streamflow pre-staged when downloads are disabled
    StagedStreamflow,
    /// Pre-built SFINCS model present
    PrebuiltModel,
}

impl StageCheck {
    fn apply(self, config: &Config) -> Vec<String> {
        let mut errors = Vec::new();
        let raw = &config.paths.raw_download_dir;
        let meteo = config.simulation.meteo_source;

        match self {
            StageCheck::ParmDir => {
                if !config.paths.parm_dir.is_dir() {
                    errors.push(format!(
                        "parameter directory not found: {}",
                        config.paths.parm_dir.display()
                    ));
                }
            }
            StageCheck::BoundaryInputs => match config.boundary.source {
                BoundarySource::Tpxo => {
                    if !config.paths.tpxo_data_dir.is_dir() {
                        errors.push(format!(
                            "TPXO atlas directory not found: {}",
                            config.paths.tpxo_data_dir.display()
                        ));
                    }
                }
                BoundarySource::Stofs => {
                    if config.boundary.stofs_file.is_none() && !config.download.enabled {
                        errors.push(
                            "boundary.stofs_file is required when download is disabled".to_string(),
                        );
                    }
                }
            },
            StageCheck::StagedForcing => {
                let dir = meteo_dir(raw, meteo);
                if !config.download.enabled && !dir.is_dir() {
                    errors.push(format!("forcing directory not found: {}", dir.display()));
                }
            }
            StageCheck::StagedStreamflow => {
                let dir = streamflow_dir(raw, meteo);
                if !config.download.enabled && !dir.is_dir() {
                    errors.push(format!("streamflow directory not found: {}", dir.display()));
                }
            }
            StageCheck::PrebuiltModel => {
                if let ModelConfig::Sfincs(sfincs) = &config.model_config {
                    if !sfincs.prebuilt_dir.is_dir() {
                        errors.push(format!(
                            "pre-built model directory not found: {}",
                            sfincs.prebuilt_dir.display()
                        ));
                    }
                }
            }
        }
        errors
    }
}

/// Runs `{scripts_dir}/{model}/{name}.bash` in the work directory.
#[derive(Debug, Clone)]
pub struct ScriptStage {
    name: String,
    mpi: bool,
    produces: Vec<PathBuf>,
    checks: Vec<StageCheck>,
    max_artifact_bytes: u64,
}

impl ScriptStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mpi: false,
            produces: Vec::new(),
            checks: Vec::new(),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }

    /// The script launches an MPI program through `$MPI_LAUNCHER`.
    pub fn mpi(mut self, mpi: bool) -> Self {
        self.mpi = mpi;
        self
    }

    /// Artifacts, relative to the work directory, cleared before and checked after a run.
    pub fn produces<P: Into<PathBuf>>(mut self, artifacts: impl IntoIterator<Item = P>) -> Self {
        self.produces.extend(artifacts.into_iter().map(Into::into));
        self
    }

    pub fn checks(mut self, checks: impl IntoIterator<Item = StageCheck>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn max_artifact_bytes(mut self, bytes: u64) -> Self {
        self.max_artifact_bytes = bytes;
        self
    }

    pub fn script_path(&self, config: &Config) -> PathBuf {
        config
            .paths
            .scripts_dir
            .join(config.model.as_str())
            .join(format!("{}.bash", self.name))
    }
}

impl Stage for ScriptStage {
    fn validate(&self, config: &Config) -> Vec<String> {
        let mut errors = Vec::new();

        let script = self.script_path(config);
        if !script.is_file() {
            errors.push(format!("stage script not found: {}", script.display()));
        }
        if self.mpi && config.model_variant().mpi_tasks() == 0 {
            errors.push("MPI stage needs at least one task".to_string());
        }
        for check in &self.checks {
            errors.extend(check.apply(config));
        }
        errors
    }

    fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<Payload> {
        let script = self.script_path(ctx.config);
        let work_dir = &ctx.config.paths.work_dir;
        if !script.is_file() {
            anyhow::bail!("stage script not found: {}", script.display());
        }

        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("creating work directory {}", work_dir.display()))?;

        // Stale artifacts from an earlier attempt must not satisfy this one
        for artifact in &self.produces {
            remove_artifact(&work_dir.join(artifact))?;
        }

        if self.mpi {
            ctx.monitor.substep(
                ctx.stage,
                format!(
                    "launching with '{}'",
                    ctx.env.get("MPI_LAUNCHER").unwrap_or("mpiexec")
                ),
            );
        }

        let output = Command::new("bash")
            .arg(&script)
            .current_dir(work_dir)
            .envs(ctx.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("launching {}", script.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}:\n{}",
                script.display(),
                output.status,
                tail(&stderr, STDERR_TAIL_LINES)
            );
        }

        let mut artifacts = Vec::new();
        for artifact in &self.produces {
            let path = work_dir.join(artifact);
            if !path.exists() {
                anyhow::bail!("expected artifact {} was not produced", path.display());
            }
            let bytes = disk_usage(&path)?;
            if bytes > self.max_artifact_bytes {
                anyhow::bail!(
                    "artifact {} is {} bytes, above the {} byte limit",
                    path.display(),
                    bytes,
                    self.max_artifact_bytes
                );
            }
            artifacts.push(json!({ "path": path, "bytes": bytes }));
        }

        let mut payload = Payload::new();
        payload.insert("script".into(), json!(script));
        payload.insert("exit_code".into(), json!(output.status.code()));
        payload.insert("artifacts".into(), Value::Array(artifacts));
        Ok(payload)
    }
}

fn remove_artifact(path: &Path) -> anyhow::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return Ok(()),
    };
    result.with_context(|| format!("removing stale artifact {}", path.display()))
}

/// Size of a file, or of everything under a directory.
fn disk_usage(path: &Path) -> anyhow::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += disk_usage(&entry?.path())?;
    }
    Ok(total)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DataKind, DownloadError};
    use crate::pipeline::{RunEnvironment, WorkflowMonitor};
    use object_store::memory::InMemory;
    use object_store::PutPayload;
    use tempfile::TempDir;

    fn config(root: &Path) -> Config {
        Config::from_yaml(&format!(
            r#"
simulation:
  start_date: 2021-06-11
  duration_hours: 1
  coastal_domain: hawaii
  meteo_source: nwm_ana
paths:
  root_dir: {}
"#,
            root.display()
        ))
        .unwrap()
    }

    fn write_script(config: &Config, name: &str, body: &str) {
        let dir = config.paths.scripts_dir.join("schism");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.bash")), body).unwrap();
    }

    fn run(stage: &dyn Stage, config: &Config) -> anyhow::Result<Payload> {
        let env = RunEnvironment::with_allocation(config, None);
        let monitor = WorkflowMonitor::new();
        let ctx = StageContext {
            config,
            env: &env,
            monitor: &monitor,
            stage: "test",
        };
        stage.run(&ctx)
    }

    #[test]
    fn test_script_sees_environment() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        write_script(
            &config,
            "update_params",
            "echo \"$STARTPDY$STARTCYC $COASTAL_DOMAIN\" > param.nml\n",
        );

        let stage = ScriptStage::new("update_params").produces(["param.nml"]);
        let payload = run(&stage, &config).unwrap();

        let written = std::fs::read_to_string(config.paths.work_dir.join("param.nml")).unwrap();
        assert_eq!(written.trim(), "2021061100 hawaii");
        assert_eq!(payload["exit_code"], json!(0));
        assert_eq!(payload["artifacts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_script_reports_stderr() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        write_script(&config, "pre_schism", "echo 'mesh not found' >&2\nexit 3\n");

        let err = run(&ScriptStage::new("pre_schism"), &config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mesh not found"));
    }

    #[test]
    fn test_stale_artifact_cleared_before_run() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        std::fs::create_dir_all(&config.paths.work_dir).unwrap();
        std::fs::write(config.paths.work_dir.join("station.in"), "old").unwrap();
        write_script(&config, "schism_obs", "true\n");

        let stage = ScriptStage::new("schism_obs").produces(["station.in"]);
        let err = run(&stage, &config).unwrap_err();
        assert!(err.to_string().contains("was not produced"));
        assert!(!config.paths.work_dir.join("station.in").exists());
    }

    #[test]
    fn test_oversized_artifact_rejected() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        write_script(&config, "sfincs_precip", "mkdir -p out && head -c 2048 /dev/zero > out/precip.nc\n");

        let stage = ScriptStage::new("sfincs_precip")
            .produces(["out"])
            .max_artifact_bytes(1024);
        let err = run(&stage, &config).unwrap_err();
        assert!(err.to_string().contains("2048 bytes"));
    }

    #[test]
    fn test_validate_reports_missing_inputs() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());

        let stage = ScriptStage::new("boundary_conditions")
            .checks([StageCheck::BoundaryInputs, StageCheck::ParmDir]);
        let errors = stage.validate(&config);
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("boundary_conditions.bash"));
        assert!(errors[1].contains("TPXO"));
        assert!(errors[2].contains("parameter directory"));
    }

    #[test]
    fn test_download_stage_rejects_unavailable_dates() {
        let root = TempDir::new().unwrap();
        let config = Config::from_yaml(&format!(
            r#"
simulation:
  start_date: 2015-06-11
  duration_hours: 6
  coastal_domain: hawaii
  meteo_source: nwm_retro
paths:
  root_dir: {}
"#,
            root.path().display()
        ))
        .unwrap();

        let errors = DownloadStage::new().validate(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.contains("nwm_retro")));
    }

    /// Download stage whose NWM bucket is served from memory, holding the
    /// files of `kinds` for the run window of `config`.
    fn memory_download_stage(config: &Config, kinds: &[DataKind]) -> DownloadStage {
        let memory = Arc::new(InMemory::new());
        let planner = Downloader::new(StoreRegistry::default(), DownloadOptions::default());
        for task in planner.plan(&DownloadRequest::from_config(config)).unwrap() {
            if kinds.contains(&task.kind) {
                let location = object_store::path::Path::from(task.remote.key.as_str());
                futures::executor::block_on(
                    memory.put(&location, PutPayload::from(b"netcdf".to_vec())),
                )
                .unwrap();
            }
        }
        DownloadStage::new().with_store("noaa-nwm-pds", memory)
    }

    #[test]
    fn test_download_stage_reports_tallies() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let stage = memory_download_stage(&config, &[DataKind::Meteo, DataKind::Hydro]);

        let payload = run(&stage, &config).unwrap();
        assert_eq!(payload["meteo"]["total_files"], json!(2));
        assert_eq!(payload["meteo"]["successful"], json!(2));
        assert_eq!(payload["hydro"]["successful"], json!(2));
        assert_eq!(payload["coastal"]["total_files"], json!(0));
        assert_eq!(payload["metrics"]["files_downloaded"], json!(4));

        let forcing = meteo_dir(&config.paths.raw_download_dir, config.simulation.meteo_source);
        assert!(forcing.join("2021061101.LDASIN_DOMAIN1").is_file());
    }

    #[test]
    fn test_download_stage_fails_on_missing_files() {
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        assert!(config.download.raise_on_error);
        // Streamflow is absent remotely
        let stage = memory_download_stage(&config, &[DataKind::Meteo]);

        let err = run(&stage, &config).unwrap_err();
        assert!(err.to_string().contains("2 of 4 downloads failed"));
        match err.downcast_ref::<DownloadError>() {
            Some(DownloadError::Failed { results, .. }) => {
                assert_eq!(results.meteo.successful, 2);
                assert_eq!(results.hydro.failed, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
