//! Environment handed to stage scripts.

use crate::config::{BoundarySource, Config};
use crate::download::sources::{meteo_dir, stofs_file, streamflow_dir};
use chrono::Datelike;
use serde::Serialize;
use std::collections::BTreeMap;

/// Variable marking an existing SLURM allocation.
pub const ALLOCATION_VAR: &str = "SLURM_JOB_ID";

/// Variables exported to every stage script of one run.
///
/// Built once per run from the resolved configuration. Stages read
/// everything they need from here rather than from the process environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunEnvironment {
    vars: BTreeMap<String, String>,
    allocation: Option<String>,
}

impl RunEnvironment {
    /// Build from `config`, detecting an enclosing SLURM allocation.
    pub fn build(config: &Config) -> Self {
        let allocation = std::env::var(ALLOCATION_VAR)
            .ok()
            .filter(|id| !id.trim().is_empty());
        Self::with_allocation(config, allocation)
    }

    /// Build from `config` with an explicit allocation id.
    pub fn with_allocation(config: &Config, allocation: Option<String>) -> Self {
        let sim = &config.simulation;
        let paths = &config.paths;
        let start = sim.start_date;
        let end = sim.end_date();

        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set("MODEL", config.model.to_string());
        set("STARTPDY", sim.start_pdy());
        set("STARTCYC", sim.start_cyc());
        set("PDY", sim.start_pdy());
        set("cyc", sim.start_cyc());
        set("FCST_LENGTH_HRS", sim.duration_hours.to_string());
        set("FCST_TIMESTEP_LENGTH_SECS", sim.timestep_seconds.to_string());
        set("COASTAL_DOMAIN", sim.coastal_domain.to_string());
        set("METEO_SOURCE", sim.meteo_source.as_str().to_ascii_uppercase());
        set("COASTAL_SOURCE", config.boundary.source.to_string());
        set(
            "USE_TPXO",
            if config.boundary.source == BoundarySource::Tpxo { "YES" } else { "NO" }.to_string(),
        );

        set("COASTAL_ROOT_DIR", paths.root_dir.display().to_string());
        set("COASTAL_WORK_DIR", paths.work_dir.display().to_string());
        set("RAW_DOWNLOAD_DIR", paths.raw_download_dir.display().to_string());
        set("COASTAL_SCRIPTS_DIR", paths.scripts_dir.display().to_string());
        set("PARM_DIR", paths.parm_dir.display().to_string());
        set("TPXO_DATA_DIR", paths.tpxo_data_dir.display().to_string());
        set(
            "HOT_START_FILE",
            paths
                .hot_start_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );

        let stofs = match (&config.boundary.stofs_file, config.boundary.source) {
            (Some(file), _) => file.display().to_string(),
            (None, BoundarySource::Stofs) => stofs_file(&paths.raw_download_dir, start)
                .destination
                .display()
                .to_string(),
            (None, BoundarySource::Tpxo) => String::new(),
        };
        set("STOFS_FILE", stofs);
        set(
            "NWM_FORCING_DIR",
            meteo_dir(&paths.raw_download_dir, sim.meteo_source)
                .display()
                .to_string(),
        );
        set(
            "NWM_CHROUT_DIR",
            streamflow_dir(&paths.raw_download_dir, sim.meteo_source)
                .display()
                .to_string(),
        );

        set("FORCING_BEGIN_DATE", start.format("%Y%m%d%H00").to_string());
        set("FORCING_END_DATE", end.format("%Y%m%d%H00").to_string());
        set("END_DATETIME", end.format("%Y%m%d%H").to_string());
        set("FORCING_START_YEAR", start.year().to_string());
        set("FORCING_START_MONTH", start.format("%m").to_string());
        set("FORCING_START_DAY", start.format("%d").to_string());
        set("FORCING_START_HOUR", start.format("%H").to_string());

        set("HDF5_USE_FILE_LOCKING", "FALSE".to_string());

        config
            .model_variant()
            .build_environment(config, allocation.is_some(), &mut vars);

        Self { vars, allocation }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Id of the SLURM allocation this process runs in, if any.
    pub fn allocation(&self) -> Option<&str> {
        self.allocation.as_deref()
    }

    pub fn in_allocation(&self) -> bool {
        self.allocation.is_some()
    }
}
