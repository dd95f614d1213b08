//! Stage abstraction: a named, ordered unit of work with its own checks.

use super::environment::RunEnvironment;
use super::monitor::WorkflowMonitor;
use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Structured output of a stage.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Where a stage executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locus {
    /// The submitting (control) node
    Control,
    /// Inside the batch job allocation
    Job,
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Locus::Control => "control",
            Locus::Job => "job",
        })
    }
}

impl FromStr for Locus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Locus::Control),
            "job" => Ok(Locus::Job),
            other => Err(format!("unknown locus '{other}' (expected control or job)")),
        }
    }
}

/// Everything a running stage may read.
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub env: &'a RunEnvironment,
    pub monitor: &'a WorkflowMonitor,
    /// Name the stage runs under
    pub stage: &'a str,
}

/// Behavior of one stage.
pub trait Stage: Send + Sync {
    /// Prerequisite checks; an empty list means ready to run.
    fn validate(&self, _config: &Config) -> Vec<String> {
        Vec::new()
    }

    fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<Payload>;
}

impl<F> Stage for F
where
    F: Fn(&StageContext<'_>) -> anyhow::Result<Payload> + Send + Sync,
{
    fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<Payload> {
        self(ctx)
    }
}

/// A stage with its pipeline metadata.
#[derive(Clone)]
pub struct StageDescriptor {
    name: String,
    description: String,
    locus: Locus,
    ordinal: usize,
    /// File in the work directory an earlier stage must have produced
    requires: Option<PathBuf>,
    stage: Arc<dyn Stage>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, locus: Locus, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            locus,
            ordinal: 0,
            requires: None,
            stage,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires = Some(path.into());
        self
    }

    pub(crate) fn set_ordinal(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn locus(&self) -> Locus {
        self.locus
    }

    /// Position in the full pipeline.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn requires(&self) -> Option<&PathBuf> {
        self.requires.as_ref()
    }

    /// Stage checks, each message prefixed with the stage name.
    pub fn validate(&self, config: &Config) -> Vec<String> {
        self.stage
            .validate(config)
            .into_iter()
            .map(|message| format!("{}: {}", self.name, message))
            .collect()
    }

    /// Run the stage after confirming its declared dependency exists.
    pub fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<Payload> {
        if let Some(required) = &self.requires {
            let path = ctx.config.paths.work_dir.join(required);
            if !path.exists() {
                anyhow::bail!(
                    "required input {} is missing; run the stage that produces it first",
                    path.display()
                );
            }
        }
        self.stage.run(ctx)
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("locus", &self.locus)
            .field("ordinal", &self.ordinal)
            .field("requires", &self.requires)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunEnvironment;
    use tempfile::TempDir;

    #[test]
    fn test_locus_parse() {
        assert_eq!("job".parse::<Locus>(), Ok(Locus::Job));
        assert_eq!("control".parse::<Locus>(), Ok(Locus::Control));
        assert!("node".parse::<Locus>().is_err());
    }

    #[test]
    fn test_missing_requirement_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "simulation: {{start_date: 2021-06-11, duration_hours: 1, coastal_domain: pacific, meteo_source: nwm_ana}}\npaths: {{work_dir: {}}}\n",
            dir.path().display()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let env = RunEnvironment::with_allocation(&config, None);
        let monitor = WorkflowMonitor::new();

        let stage = StageDescriptor::new(
            "schism_run",
            Locus::Job,
            Arc::new(|_: &StageContext<'_>| -> anyhow::Result<Payload> { panic!("must not run") }),
        )
        .with_requires("param.nml");
        let ctx = StageContext {
            config: &config,
            env: &env,
            monitor: &monitor,
            stage: "schism_run",
        };

        let err = stage.run(&ctx).unwrap_err();
        assert!(err.to_string().contains("param.nml"));

        std::fs::write(dir.path().join("param.nml"), "&CORE\n/\n").unwrap();
        let ok = StageDescriptor::new(
            "schism_run",
            Locus::Job,
            Arc::new(|_: &StageContext<'_>| -> anyhow::Result<Payload> { Ok(Payload::new()) }),
        )
        .with_requires("param.nml");
        assert!(ok.run(&ctx).is_ok());
    }
}
