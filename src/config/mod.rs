//! Configuration for the coastal calibration workflow.
//!
//! A run is described by a layered YAML (or JSON) document. [`resolve`]
//! turns that document into an immutable [`Config`]: inheritance through the
//! `_base` key is merged, `${section.field}` tokens are substituted, derived
//! paths are filled from templates, and every value is checked.

mod resolver;

pub use resolver::{deep_merge, interpolate, resolve, INHERIT_KEY};

use crate::error::Result;
use crate::pipeline::models::ModelVariant;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fully resolved configuration for one calibration run.
///
/// Constructed only through [`resolve`]; never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Model family driving the stage order
    pub model: ModelType,

    /// Batch scheduler directives
    pub slurm: SlurmConfig,

    /// Simulation window and domain
    pub simulation: SimulationConfig,

    /// Open boundary forcing
    pub boundary: BoundaryConfig,

    /// Filesystem layout
    pub paths: PathConfig,

    /// Model-specific settings, selected by `model`
    pub model_config: ModelConfig,

    /// Logging, result persistence and job polling
    pub monitoring: MonitoringConfig,

    /// Input data acquisition
    pub download: DownloadConfig,
}

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Schism,
    Sfincs,
}

/// Supported coastal domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoastalDomain {
    Atlgulf,
    Pacific,
    Hawaii,
    Prvi,
}

/// Meteorological forcing products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteoSource {
    /// NWM 3.0 retrospective
    NwmRetro,
    /// NWM operational analysis and assimilation
    NwmAna,
}

/// Open boundary forcing sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundarySource {
    /// Tidal harmonics from a local TPXO atlas
    #[default]
    Tpxo,
    /// STOFS-2D global water level fields
    Stofs,
}

macro_rules! keyword_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}' (expected one of: {})",
                        $what,
                        other,
                        [$($name),+].join(", ")
                    )),
                }
            }
        }
    };
}

keyword_enum!(ModelType, "model", { Schism => "schism", Sfincs => "sfincs" });
keyword_enum!(CoastalDomain, "coastal domain", {
    Atlgulf => "atlgulf",
    Pacific => "pacific",
    Hawaii => "hawaii",
    Prvi => "prvi",
});
keyword_enum!(MeteoSource, "meteo source", { NwmRetro => "nwm_retro", NwmAna => "nwm_ana" });
keyword_enum!(BoundarySource, "boundary source", { Tpxo => "tpxo", Stofs => "stofs" });

/// SLURM job directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,

    #[serde(default = "default_partition")]
    pub partition: String,

    /// Wall-clock limit, `HH:MM:SS` or `D-HH:MM:SS`
    #[serde(default)]
    pub time_limit: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub qos: Option<String>,

    /// Submitting user, used to filter queue listings
    #[serde(default)]
    pub user: Option<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            partition: default_partition(),
            time_limit: None,
            account: None,
            qos: None,
            user: None,
        }
    }
}

/// Simulation window and domain.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationConfig {
    /// First valid time of the simulation, on the hour
    pub start_date: NaiveDateTime,

    /// Forecast length in hours
    pub duration_hours: i64,

    pub coastal_domain: CoastalDomain,

    pub meteo_source: MeteoSource,

    /// Forcing timestep in seconds
    pub timestep_seconds: u64,
}

impl SimulationConfig {
    /// Last valid time of the simulation window, saturating at
    /// [`NaiveDateTime::MAX`].
    pub fn end_date(&self) -> NaiveDateTime {
        chrono::Duration::try_hours(self.duration_hours)
            .and_then(|d| self.start_date.checked_add_signed(d))
            .unwrap_or(NaiveDateTime::MAX)
    }

    /// Start day as `YYYYMMDD`.
    pub fn start_pdy(&self) -> String {
        self.start_date.format("%Y%m%d").to_string()
    }

    /// Start cycle hour as `HH`.
    pub fn start_cyc(&self) -> String {
        self.start_date.format("%H").to_string()
    }
}

/// Open boundary configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BoundaryConfig {
    pub source: BoundarySource,

    /// Pre-staged STOFS file; when unset and source is `stofs`, it is downloaded
    pub stofs_file: Option<PathBuf>,
}

/// Filesystem layout. Every path is concrete after resolution.
#[derive(Debug, Clone, Serialize)]
pub struct PathConfig {
    pub root_dir: PathBuf,
    pub work_dir: PathBuf,
    pub raw_download_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub parm_dir: PathBuf,
    pub tpxo_data_dir: PathBuf,
    pub hot_start_file: Option<PathBuf>,
}

/// Model-specific configuration, one variant per [`ModelType`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ModelConfig {
    Schism(SchismConfig),
    Sfincs(SfincsConfig),
}

impl ModelConfig {
    pub fn model_type(&self) -> ModelType {
        self.variant().model_type()
    }

    /// Polymorphic view used for stage creation, validation and environment.
    pub fn variant(&self) -> &dyn ModelVariant {
        match self {
            ModelConfig::Schism(schism) => schism,
            ModelConfig::Sfincs(sfincs) => sfincs,
        }
    }
}

/// SCHISM compute layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchismConfig {
    #[serde(default = "default_schism_nodes")]
    pub nodes: u32,

    #[serde(default = "default_ntasks_per_node")]
    pub ntasks_per_node: u32,

    /// Dedicated I/O ranks
    #[serde(default = "default_nscribes")]
    pub nscribes: u32,

    #[serde(default = "default_schism_omp_threads")]
    pub omp_num_threads: u32,

    #[serde(default = "default_true")]
    pub exclusive: bool,

    #[serde(default)]
    pub oversubscribe: bool,
}

impl SchismConfig {
    /// Total MPI ranks.
    pub fn total_tasks(&self) -> u32 {
        self.nodes.saturating_mul(self.ntasks_per_node)
    }
}

impl Default for SchismConfig {
    fn default() -> Self {
        Self {
            nodes: default_schism_nodes(),
            ntasks_per_node: default_ntasks_per_node(),
            nscribes: default_nscribes(),
            omp_num_threads: default_schism_omp_threads(),
            exclusive: true,
            oversubscribe: false,
        }
    }
}

/// SFINCS run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SfincsConfig {
    /// Directory holding the pre-built SFINCS model (grid, masks, inputs)
    pub prebuilt_dir: PathBuf,

    #[serde(default = "default_sfincs_omp_threads")]
    pub omp_num_threads: u32,

    #[serde(default = "default_sfincs_nodes")]
    pub nodes: u32,
}

/// Logging, result persistence and job polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Default log filter when `COASTAL_CALIB_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persisted run results
    #[serde(default)]
    pub result_dir: Option<PathBuf>,

    /// Initial delay between scheduler status queries
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound for the polling backoff
    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,

    /// Consecutive `Unknown` answers tolerated before giving up on a job
    #[serde(default = "default_unknown_poll_threshold")]
    pub unknown_poll_threshold: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            result_dir: None,
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            unknown_poll_threshold: default_unknown_poll_threshold(),
        }
    }
}

/// Input data acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// When false the download stage is skipped and inputs must be pre-staged
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Leave non-empty existing files untouched
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Per-file timeout in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,

    /// Fail the stage when any file fails
    #[serde(default = "default_true")]
    pub raise_on_error: bool,

    /// Concurrent requests per remote bucket
    #[serde(default = "default_concurrency_per_host")]
    pub concurrency_per_host: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_existing: true,
            timeout_secs: default_download_timeout_secs(),
            raise_on_error: true,
            concurrency_per_host: default_concurrency_per_host(),
        }
    }
}

impl Config {
    /// Resolve a configuration file, following its `_base` chain.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        resolve(path.as_ref())
    }

    /// Resolve a YAML string. A `_base` key is taken relative to the
    /// current directory.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        resolver::resolve_str(yaml)
    }

    /// Serialize the resolved configuration to YAML.
    ///
    /// The output contains no interpolation tokens and resolves to an
    /// identical configuration.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Model variant selected by this configuration.
    pub fn model_variant(&self) -> &dyn ModelVariant {
        self.model_config.variant()
    }

    /// Checks that need the fully typed configuration.
    ///
    /// Returns every violation found; an empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (field, path) in [
            ("paths.root_dir", &self.paths.root_dir),
            ("paths.work_dir", &self.paths.work_dir),
            ("paths.raw_download_dir", &self.paths.raw_download_dir),
            ("paths.scripts_dir", &self.paths.scripts_dir),
            ("paths.parm_dir", &self.paths.parm_dir),
            ("paths.tpxo_data_dir", &self.paths.tpxo_data_dir),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(format!("{field} must not be empty"));
            }
        }

        if let Some(hot_start) = &self.paths.hot_start_file {
            if !hot_start.exists() {
                errors.push(format!(
                    "paths.hot_start_file does not exist: {}",
                    hot_start.display()
                ));
            }
        }

        if let Some(stofs_file) = &self.boundary.stofs_file {
            if self.boundary.source == BoundarySource::Stofs && !stofs_file.exists() {
                errors.push(format!(
                    "boundary.stofs_file does not exist: {}",
                    stofs_file.display()
                ));
            }
        }

        if let Some(limit) = &self.slurm.time_limit {
            if !is_valid_time_limit(limit) {
                errors.push(format!(
                    "slurm.time_limit '{limit}' must look like HH:MM:SS or D-HH:MM:SS"
                ));
            }
        }

        if self.download.timeout_secs == 0 {
            errors.push("download.timeout_secs must be > 0".to_string());
        }
        if self.download.concurrency_per_host == 0 {
            errors.push("download.concurrency_per_host must be > 0".to_string());
        }
        if self.monitoring.poll_interval_secs == 0 {
            errors.push("monitoring.poll_interval_secs must be > 0".to_string());
        }
        if self.monitoring.max_poll_interval_secs < self.monitoring.poll_interval_secs {
            errors.push(
                "monitoring.max_poll_interval_secs must be >= monitoring.poll_interval_secs"
                    .to_string(),
            );
        }
        if self.monitoring.unknown_poll_threshold == 0 {
            errors.push("monitoring.unknown_poll_threshold must be > 0".to_string());
        }

        if self.model_config.model_type() != self.model {
            errors.push(format!(
                "model_config does not match model '{}'",
                self.model
            ));
        }
        errors.extend(self.model_variant().validate(self));

        errors
    }
}

fn is_valid_time_limit(limit: &str) -> bool {
    let (days, clock) = match limit.split_once('-') {
        Some((days, clock)) => (Some(days), clock),
        None => (None, limit),
    };
    if let Some(days) = days {
        if days.is_empty() || !days.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    let parts: Vec<&str> = clock.split(':').collect();
    (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

// Default value functions for serde
fn default_job_name() -> String { "coastal_calibration".to_string() }
fn default_partition() -> String { "c5n-18xlarge".to_string() }
fn default_true() -> bool { true }
fn default_schism_nodes() -> u32 { 2 }
fn default_ntasks_per_node() -> u32 { 18 }
fn default_nscribes() -> u32 { 2 }
fn default_schism_omp_threads() -> u32 { 2 }
fn default_sfincs_omp_threads() -> u32 { 36 }
fn default_sfincs_nodes() -> u32 { 1 }
fn default_log_level() -> String { "info".to_string() }
fn default_poll_interval_secs() -> u64 { 30 }
fn default_max_poll_interval_secs() -> u64 { 300 }
fn default_unknown_poll_threshold() -> u32 { 5 }
fn default_download_timeout_secs() -> u64 { 120 }
fn default_concurrency_per_host() -> usize { 8 }
