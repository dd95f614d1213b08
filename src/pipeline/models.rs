//! Model variants: stage sequences, checks, environment and job shape per model.

use super::stage::{Locus, StageDescriptor};
use super::stages::{DownloadStage, ScriptStage, StageCheck};
use crate::config::{Config, ModelType, SchismConfig, SfincsConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a stage is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Download,
    Script,
    /// Script launching an MPI program
    MpiScript,
}

/// Static description of one stage of a model.
#[derive(Debug, Clone, Copy)]
pub struct StageTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub locus: Locus,
    pub kind: StageKind,
    pub requires: Option<&'static str>,
    pub produces: &'static [&'static str],
    pub checks: &'static [StageCheck],
}

impl StageTemplate {
    fn build(&self) -> StageDescriptor {
        let stage: Arc<dyn super::Stage> = match self.kind {
            StageKind::Download => Arc::new(DownloadStage::new()),
            StageKind::Script | StageKind::MpiScript => Arc::new(
                ScriptStage::new(self.name)
                    .mpi(self.kind == StageKind::MpiScript)
                    .produces(self.produces.iter().copied())
                    .checks(self.checks.iter().copied()),
            ),
        };
        let descriptor =
            StageDescriptor::new(self.name, self.locus, stage).with_description(self.description);
        match self.requires {
            Some(path) => descriptor.with_requires(path),
            None => descriptor,
        }
    }
}

macro_rules! stage {
    (@opt $value:literal) => { Some($value) };
    (@opt) => { None };
    ($name:literal, $locus:ident, $kind:ident, $description:literal
     $(, requires = $requires:literal)?
     $(, produces = [$($produces:literal),*])?
     $(, checks = [$($check:ident),*])?) => {
        StageTemplate {
            name: $name,
            description: $description,
            locus: Locus::$locus,
            kind: StageKind::$kind,
            requires: stage!(@opt $($requires)?),
            produces: &[$($($produces),*)?],
            checks: &[$($(StageCheck::$check),*)?],
        }
    };
}

pub const SCHISM_STAGES: &[StageTemplate] = &[
    stage!("download", Control, Download, "Fetch NWM forcing, streamflow and STOFS water levels"),
    stage!("pre_forcing", Job, Script, "Prepare forcing inputs",
        checks = [StagedForcing, StagedStreamflow]),
    stage!("nwm_forcing", Job, MpiScript, "Regrid NWM forcing onto the mesh",
        produces = ["sflux"]),
    stage!("post_forcing", Job, Script, "Finalize atmospheric forcing", requires = "sflux"),
    stage!("update_params", Job, Script, "Write run parameters",
        produces = ["param.nml"], checks = [ParmDir]),
    stage!("schism_obs", Control, Script, "Select observation stations",
        produces = ["station.in"]),
    stage!("boundary_conditions", Job, Script, "Build open boundary forcing",
        checks = [BoundaryInputs]),
    stage!("pre_schism", Job, Script, "Stage inputs for the solver", requires = "param.nml"),
    stage!("schism_run", Job, MpiScript, "Run SCHISM",
        requires = "param.nml", produces = ["outputs"]),
    stage!("post_schism", Job, Script, "Post-process solver output", requires = "outputs"),
    stage!("schism_plot", Control, Script, "Plot water levels against observations",
        requires = "outputs"),
];

pub const SFINCS_STAGES: &[StageTemplate] = &[
    stage!("download", Control, Download, "Fetch NWM forcing, streamflow and STOFS water levels"),
    stage!("sfincs_symlinks", Control, Script, "Link the pre-built model into the work directory",
        checks = [PrebuiltModel]),
    stage!("sfincs_data_catalog", Control, Script, "Write the data catalog",
        produces = ["data_catalog.yml"]),
    stage!("sfincs_init", Control, Script, "Initialize the model from the pre-built setup",
        requires = "data_catalog.yml"),
    stage!("sfincs_timing", Control, Script, "Set the simulation window"),
    stage!("sfincs_forcing", Control, Script, "Build water level boundary forcing",
        produces = ["sfincs.bzs"], checks = [BoundaryInputs]),
    stage!("sfincs_obs", Control, Script, "Add observation points", produces = ["sfincs.obs"]),
    stage!("sfincs_discharge", Control, Script, "Add river discharge",
        checks = [StagedStreamflow]),
    stage!("sfincs_precip", Control, Script, "Add gridded precipitation",
        produces = ["precip_2d.nc"], checks = [StagedForcing]),
    stage!("sfincs_wind", Control, Script, "Add gridded wind",
        produces = ["wind_2d.nc"], checks = [StagedForcing]),
    stage!("sfincs_pressure", Control, Script, "Add gridded pressure",
        produces = ["press_2d.nc"], checks = [StagedForcing]),
    stage!("sfincs_write", Control, Script, "Write model input files", produces = ["sfincs.inp"]),
    stage!("sfincs_run", Job, MpiScript, "Run SFINCS", requires = "sfincs.inp"),
    stage!("sfincs_plot", Control, Script, "Plot water levels against observations"),
];

/// Stage templates of `model`, in execution order.
pub fn stage_templates(model: ModelType) -> &'static [StageTemplate] {
    match model {
        ModelType::Schism => SCHISM_STAGES,
        ModelType::Sfincs => SFINCS_STAGES,
    }
}

/// Behavior that differs between model families.
pub trait ModelVariant: Send + Sync {
    fn model_type(&self) -> ModelType;

    fn stage_templates(&self) -> &'static [StageTemplate] {
        stage_templates(self.model_type())
    }

    fn stage_order(&self) -> Vec<&'static str> {
        self.stage_templates().iter().map(|t| t.name).collect()
    }

    fn create_stages(&self) -> Vec<StageDescriptor> {
        self.stage_templates().iter().map(StageTemplate::build).collect()
    }

    /// Model-specific consistency checks.
    fn validate(&self, config: &Config) -> Vec<String>;

    /// Add model variables to the run environment.
    fn build_environment(&self, config: &Config, in_allocation: bool, env: &mut BTreeMap<String, String>);

    /// Resource directives for the batch job.
    fn job_directives(&self) -> Vec<String>;

    /// MPI ranks used by MPI stages.
    fn mpi_tasks(&self) -> u32;
}

fn launcher(in_allocation: bool, tasks: u32, oversubscribe: bool) -> String {
    if in_allocation {
        format!("srun --mpi=pmi2 -n {tasks}")
    } else if oversubscribe {
        format!("mpiexec --oversubscribe -n {tasks}")
    } else {
        format!("mpiexec -n {tasks}")
    }
}

impl ModelVariant for SchismConfig {
    fn model_type(&self) -> ModelType {
        ModelType::Schism
    }

    fn validate(&self, _config: &Config) -> Vec<String> {
        let mut errors = Vec::new();
        if self.nodes == 0 {
            errors.push("model_config.nodes must be > 0".to_string());
        }
        if self.ntasks_per_node == 0 {
            errors.push("model_config.ntasks_per_node must be > 0".to_string());
        }
        if self.omp_num_threads == 0 {
            errors.push("model_config.omp_num_threads must be > 0".to_string());
        }
        if self.nscribes >= self.total_tasks() {
            errors.push(format!(
                "model_config.nscribes ({}) must be smaller than nodes * ntasks_per_node ({})",
                self.nscribes,
                self.total_tasks()
            ));
        }
        if self.exclusive && self.oversubscribe {
            errors.push("model_config.exclusive and oversubscribe are mutually exclusive".to_string());
        }
        errors
    }

    fn build_environment(&self, config: &Config, in_allocation: bool, env: &mut BTreeMap<String, String>) {
        let start = config.simulation.start_date;
        let end = config.simulation.end_date();
        let tasks = self.total_tasks();

        env.insert("NODES".into(), self.nodes.to_string());
        env.insert("NCORES".into(), self.ntasks_per_node.to_string());
        env.insert("NPROCS".into(), tasks.to_string());
        env.insert("NSCRIBES".into(), self.nscribes.to_string());
        env.insert("OMP_NUM_THREADS".into(), self.omp_num_threads.to_string());
        env.insert("SCHISM_BEGIN_DATE".into(), start.format("%Y%m%d%H00").to_string());
        env.insert("SCHISM_END_DATE".into(), end.format("%Y%m%d%H00").to_string());
        env.insert(
            "MPI_LAUNCHER".into(),
            launcher(in_allocation, tasks, self.oversubscribe),
        );
    }

    fn job_directives(&self) -> Vec<String> {
        let mut directives = vec![
            format!("--nodes={}", self.nodes),
            format!("--ntasks-per-node={}", self.ntasks_per_node),
        ];
        if self.exclusive {
            directives.push("--exclusive".to_string());
        }
        directives
    }

    fn mpi_tasks(&self) -> u32 {
        self.total_tasks()
    }
}

impl ModelVariant for SfincsConfig {
    fn model_type(&self) -> ModelType {
        ModelType::Sfincs
    }

    fn validate(&self, _config: &Config) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.prebuilt_dir.is_dir() {
            errors.push(format!(
                "model_config.prebuilt_dir does not exist: {}",
                self.prebuilt_dir.display()
            ));
        }
        if self.omp_num_threads == 0 {
            errors.push("model_config.omp_num_threads must be > 0".to_string());
        }
        if self.nodes == 0 {
            errors.push("model_config.nodes must be > 0".to_string());
        }
        errors
    }

    fn build_environment(&self, _config: &Config, in_allocation: bool, env: &mut BTreeMap<String, String>) {
        env.insert(
            "SFINCS_PREBUILT_DIR".into(),
            self.prebuilt_dir.display().to_string(),
        );
        env.insert("OMP_NUM_THREADS".into(), self.omp_num_threads.to_string());
        env.insert("NODES".into(), self.nodes.to_string());
        env.insert("NPROCS".into(), self.nodes.to_string());
        env.insert("MPI_LAUNCHER".into(), launcher(in_allocation, self.nodes, false));
    }

    fn job_directives(&self) -> Vec<String> {
        vec![
            format!("--nodes={}", self.nodes),
            "--ntasks-per-node=1".to_string(),
            format!("--cpus-per-task={}", self.omp_num_threads),
            "--exclusive".to_string(),
        ]
    }

    fn mpi_tasks(&self) -> u32 {
        self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StagePipeline;
    use tempfile::TempDir;

    #[test]
    fn test_schism_stage_order() {
        let order = SchismConfig::default().stage_order();
        assert_eq!(
            order,
            vec![
                "download",
                "pre_forcing",
                "nwm_forcing",
                "post_forcing",
                "update_params",
                "schism_obs",
                "boundary_conditions",
                "pre_schism",
                "schism_run",
                "post_schism",
                "schism_plot",
            ]
        );
    }

    #[test]
    fn test_sfincs_stage_order() {
        let order: Vec<_> = SFINCS_STAGES.iter().map(|t| t.name).collect();
        assert_eq!(order.len(), 14);
        assert_eq!(order[0], "download");
        assert_eq!(order[12], "sfincs_run");
        assert_eq!(order[13], "sfincs_plot");
        let job: Vec<_> = SFINCS_STAGES
            .iter()
            .filter(|t| t.locus == Locus::Job)
            .map(|t| t.name)
            .collect();
        assert_eq!(job, vec!["sfincs_run"]);
    }

    #[test]
    fn test_templates_build_valid_pipelines() {
        for model in [ModelType::Schism, ModelType::Sfincs] {
            let stages = stage_templates(model).iter().map(StageTemplate::build).collect();
            let pipeline = StagePipeline::new(stages).unwrap();
            assert_eq!(pipeline.len(), stage_templates(model).len());
            assert_eq!(pipeline.get("download").unwrap().locus(), Locus::Control);
        }
    }

    #[test]
    fn test_sfincs_environment_and_directives() {
        let prebuilt = TempDir::new().unwrap();
        let config = Config::from_yaml(&format!(
            r#"
model: sfincs
simulation:
  start_date: 2022-09-28
  duration_hours: 48
  coastal_domain: atlgulf
  meteo_source: nwm_ana
model_config:
  prebuilt_dir: {}
  omp_num_threads: 16
"#,
            prebuilt.path().display()
        ))
        .unwrap();

        let variant = config.model_variant();
        assert_eq!(variant.model_type(), ModelType::Sfincs);
        assert!(variant.job_directives().contains(&"--cpus-per-task=16".to_string()));

        let mut env = BTreeMap::new();
        variant.build_environment(&config, true, &mut env);
        assert_eq!(env["OMP_NUM_THREADS"], "16");
        assert_eq!(env["MPI_LAUNCHER"], "srun --mpi=pmi2 -n 1");
        assert_eq!(
            env["SFINCS_PREBUILT_DIR"],
            prebuilt.path().display().to_string()
        );
    }

    #[test]
    fn test_schism_exclusive_and_oversubscribe_conflict() {
        let schism = SchismConfig {
            oversubscribe: true,
            ..SchismConfig::default()
        };
        let config = Config::from_yaml(
            "simulation: {start_date: 2021-06-11, duration_hours: 1, coastal_domain: prvi, meteo_source: nwm_ana}\n",
        )
        .unwrap();
        let errors = schism.validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mutually exclusive"));
    }
}
