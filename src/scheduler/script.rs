//! SLURM batch script generation.

use crate::config::{Config, ModelConfig};
use crate::error::Result;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Command the batch job runs: this program, re-entered for the job-side stages.
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub program: PathBuf,
    /// Resolved configuration snapshot
    pub config: PathBuf,
    pub start_from: String,
    pub stop_after: String,
}

impl JobInvocation {
    pub fn command_line(&self) -> String {
        format!(
            "{} --config {} run --start-from {} --stop-after {} --locus job",
            shell_quote(&self.program.to_string_lossy()),
            shell_quote(&self.config.to_string_lossy()),
            shell_quote(&self.start_from),
            shell_quote(&self.stop_after),
        )
    }
}

/// A rendered-on-demand batch script.
#[derive(Debug, Clone)]
pub struct JobScript {
    directives: Vec<String>,
    work_dir: PathBuf,
    omp_threads: u32,
    command: String,
}

impl JobScript {
    pub fn new(config: &Config, invocation: &JobInvocation) -> Self {
        let slurm = &config.slurm;
        let work_dir = config.paths.work_dir.clone();

        let mut directives = vec![
            format!("--job-name={}", slurm.job_name),
            format!("--partition={}", slurm.partition),
        ];
        if let Some(limit) = &slurm.time_limit {
            directives.push(format!("--time={limit}"));
        }
        if let Some(account) = &slurm.account {
            directives.push(format!("--account={account}"));
        }
        if let Some(qos) = &slurm.qos {
            directives.push(format!("--qos={qos}"));
        }
        directives.extend(config.model_variant().job_directives());
        directives.push(format!("--output={}", work_dir.join("slurm-%j.out").display()));
        directives.push("--open-mode=append".to_string());

        let omp_threads = match &config.model_config {
            ModelConfig::Schism(schism) => schism.omp_num_threads,
            ModelConfig::Sfincs(sfincs) => sfincs.omp_num_threads,
        };

        Self {
            directives,
            work_dir,
            omp_threads,
            command: invocation.command_line(),
        }
    }

    pub fn directives(&self) -> &[String] {
        &self.directives
    }

    pub fn render(&self) -> String {
        let mut script = String::from("#!/usr/bin/env bash\n");
        for directive in &self.directives {
            let _ = writeln!(script, "#SBATCH {directive}");
        }
        script.push('\n');
        script.push_str("set -euox pipefail\n\n");
        let _ = writeln!(script, "export OMP_NUM_THREADS={}", self.omp_threads);
        let _ = writeln!(script, "cd {}", shell_quote(&self.work_dir.to_string_lossy()));
        script.push_str("echo \"Job ${SLURM_JOB_ID} started on $(hostname) at $(date)\"\n\n");
        let _ = writeln!(script, "{}", self.command);
        script.push_str("\necho \"Job ${SLURM_JOB_ID} finished at $(date)\"\n");
        script
    }

    /// Write the script to `path` with mode 0755.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }

        tracing::info!("Job script written to {}", path.display());
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,%@".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
