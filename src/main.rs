//! Coastal calibration workflow CLI
//!
//! Resolves a run configuration and drives the SCHISM or SFINCS stage
//! sequence locally or through SLURM.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coastal_calib::config::{CoastalDomain, MeteoSource};
use coastal_calib::pipeline::{stage_templates, Locus};
use coastal_calib::{
    Config, Error, ModelType, Orchestrator, RunOptions, SchedulerClient, SlurmClient,
    SubmitOptions, WorkflowResult,
};

/// Environment variable overriding the log filter.
const LOG_ENV: &str = "COASTAL_CALIB_LOG";

#[derive(Parser)]
#[command(name = "coastal-calib")]
#[command(about = "Run coastal model calibration workflows on SLURM clusters", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Output path for the configuration file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,

        #[arg(long, default_value = "schism")]
        model: ModelType,

        #[arg(long, default_value = "hawaii")]
        domain: CoastalDomain,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Resolve the configuration and check stage prerequisites
    Validate,

    /// Run stages in this process
    Run {
        #[arg(long)]
        start_from: Option<String>,

        #[arg(long)]
        stop_after: Option<String>,

        /// Validate and list the selected stages without running them
        #[arg(long)]
        dry_run: bool,

        /// Only run stages with this locus (used inside batch jobs)
        #[arg(long, hide = true)]
        locus: Option<Locus>,
    },

    /// Run control stages here and submit job stages to SLURM
    Submit {
        /// Wait for the job and run the trailing control stages
        #[arg(short, long)]
        interactive: bool,

        #[arg(long)]
        start_from: Option<String>,

        #[arg(long)]
        stop_after: Option<String>,
    },

    /// List the stage sequence of a model
    Stages {
        /// Model to list; defaults to the configured model
        #[arg(long)]
        model: Option<ModelType>,
    },

    /// Show the state of a submitted job
    Status { job_id: String },

    /// Cancel a submitted job
    Cancel { job_id: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            e.downcast_ref::<Error>().map_or(2, Error::exit_code)
        }
    };
    std::process::exit(code);
}

fn init_tracing(cli: &Cli) {
    let configured = match cli.command {
        Commands::Validate | Commands::Run { .. } | Commands::Submit { .. } => {
            configured_log_level(&cli.config)
        }
        _ => None,
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(configured.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Log level from the configuration, if it resolves.
fn configured_log_level(path: &Path) -> Option<String> {
    Config::from_file(path).ok().map(|c| c.monitoring.log_level)
}

fn report_error(e: &anyhow::Error) {
    match e.downcast_ref::<Error>() {
        Some(error) => {
            eprintln!("Error: {error}");
        }
        None => eprintln!("Error: {e:#}"),
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init {
            output,
            model,
            domain,
            force,
        } => init_command(&output, model, domain, force),

        Commands::Validate => validate_command(&cli.config),

        Commands::Run {
            start_from,
            stop_after,
            dry_run,
            locus,
        } => run_command(
            &cli.config,
            RunOptions {
                start_from,
                stop_after,
                dry_run,
                locus,
            },
        ),

        Commands::Submit {
            interactive,
            start_from,
            stop_after,
        } => submit_command(&cli.config, interactive, start_from, stop_after),

        Commands::Stages { model } => stages_command(&cli.config, model),

        Commands::Status { job_id } => {
            let state = slurm_client(&cli.config).status(&job_id)?;
            println!("{job_id}: {state}");
            Ok(0)
        }

        Commands::Cancel { job_id } => {
            slurm_client(&cli.config).cancel(&job_id)?;
            println!("Cancellation requested for job {job_id}");
            Ok(0)
        }
    }
}

fn validate_command(config_path: &Path) -> Result<i32> {
    let orchestrator = Orchestrator::from_path(config_path)?;
    orchestrator.validate(None, None)?;
    println!("Configuration is valid");
    println!("  work_dir: {}", orchestrator.config().paths.work_dir.display());
    println!("  stages:   {}", orchestrator.pipeline().names().join(", "));
    Ok(0)
}

fn run_command(config_path: &Path, options: RunOptions) -> Result<i32> {
    let orchestrator = Orchestrator::from_path(config_path)?;
    let result = orchestrator.run(&options);
    orchestrator.monitor().print_summary();
    print_result(&result);
    Ok(result.exit_code())
}

fn submit_command(
    config_path: &Path,
    interactive: bool,
    start_from: Option<String>,
    stop_after: Option<String>,
) -> Result<i32> {
    let orchestrator = Orchestrator::from_path(config_path)?;
    let scheduler = SlurmClient::new(orchestrator.config().slurm.user.clone());
    let options = SubmitOptions {
        start_from,
        stop_after,
        wait: interactive,
        ..SubmitOptions::new(std::env::current_exe()?)
    };

    let result = orchestrator.submit(&scheduler, &options);
    if interactive {
        orchestrator.monitor().print_summary();
    }
    print_result(&result);
    if let (Some(job_id), false) = (&result.job_id, interactive) {
        println!("Follow progress with: coastal-calib status {job_id}");
    }
    Ok(result.exit_code())
}

fn stages_command(config_path: &Path, model: Option<ModelType>) -> Result<i32> {
    let model = match model {
        Some(model) => model,
        None => Config::from_file(config_path)
            .map(|c| c.model)
            .unwrap_or_default(),
    };

    println!("Stages for {model}:");
    for (i, stage) in stage_templates(model).iter().enumerate() {
        println!(
            "{:>3}. {:<22} {:<8} {}",
            i + 1,
            stage.name,
            stage.locus.to_string(),
            stage.description
        );
    }
    Ok(0)
}

fn slurm_client(config_path: &Path) -> SlurmClient {
    let user = Config::from_file(config_path).ok().and_then(|c| c.slurm.user);
    SlurmClient::new(user)
}

fn print_result(result: &WorkflowResult) {
    println!("{result}");
    for error in &result.errors {
        eprintln!("  - {error}");
    }
}

fn init_command(output: &Path, model: ModelType, domain: CoastalDomain, force: bool) -> Result<i32> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, config_template(model, domain))?;
    println!("Generated {model} configuration at: {}", output.display());
    Ok(0)
}

fn config_template(model: ModelType, domain: CoastalDomain) -> String {
    let model_config = match model {
        ModelType::Schism => {
            r#"# SCHISM resources: nodes * ntasks_per_node MPI ranks, nscribes of them for I/O
model_config:
  nodes: 2
  ntasks_per_node: 18
  nscribes: 2
  omp_num_threads: 2
  exclusive: true"#
        }
        ModelType::Sfincs => {
            r#"# SFINCS runs from a pre-built model directory
model_config:
  prebuilt_dir: ${paths.root_dir}/sfincs_prebuilt/${simulation.coastal_domain}
  omp_num_threads: 36"#
        }
    };
    let meteo = MeteoSource::NwmAna;

    format!(
        r#"# Coastal calibration run configuration
#
# Values may reference other values as ${{section.field}}. A `_base` key
# names a file whose values this one overrides.

model: {model}

# === SLURM: batch job settings ===
slurm:
  job_name: coastal_calibration
  partition: c5n-18xlarge
  # time_limit: "04:00:00"
  # account: my-account

# === SIMULATION: window and domain ===
simulation:
  start_date: 2021-06-11T00:00:00
  duration_hours: 24
  coastal_domain: {domain}
  meteo_source: {meteo}
  timestep_seconds: 3600

# === BOUNDARY: open boundary forcing (tpxo or stofs) ===
boundary:
  source: tpxo

# === PATHS: unset directories are derived from root_dir ===
paths:
  root_dir: /ngen-test/coastal
  # work_dir: ${{paths.root_dir}}/runs/my_run

{model_config}

# === MONITORING ===
monitoring:
  log_level: info
  # result_dir: ${{paths.root_dir}}/results
  poll_interval_secs: 30

# === DOWNLOAD: NWM forcing, streamflow and STOFS inputs ===
download:
  enabled: true
  skip_existing: true
  timeout_secs: 120
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse_run_range() {
        let cli = Cli::try_parse_from([
            "coastal-calib",
            "-c",
            "hawaii.yaml",
            "run",
            "--start-from",
            "pre_forcing",
            "--stop-after",
            "schism_run",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("hawaii.yaml"));
        match cli.command {
            Commands::Run {
                start_from,
                stop_after,
                dry_run,
                locus,
            } => {
                assert_eq!(start_from.as_deref(), Some("pre_forcing"));
                assert_eq!(stop_after.as_deref(), Some("schism_run"));
                assert!(!dry_run);
                assert!(locus.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parse_job_locus() {
        let cli = Cli::try_parse_from(["coastal-calib", "run", "--locus", "job"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { locus: Some(Locus::Job), .. }));
        assert!(Cli::try_parse_from(["coastal-calib", "run", "--locus", "node"]).is_err());
    }

    #[test]
    fn test_cli_parse_submit_and_stages() {
        let cli = Cli::try_parse_from(["coastal-calib", "submit", "-i"]).unwrap();
        assert!(matches!(cli.command, Commands::Submit { interactive: true, .. }));

        let cli = Cli::try_parse_from(["coastal-calib", "stages", "--model", "sfincs"]).unwrap();
        assert!(matches!(cli.command, Commands::Stages { model: Some(ModelType::Sfincs) }));
        assert!(Cli::try_parse_from(["coastal-calib", "stages", "--model", "adcirc"]).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["coastal-calib"]).is_err());
    }

    #[test]
    fn test_init_template_resolves() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("conf").join("config.yaml");

        assert_eq!(init_command(&output, ModelType::Schism, CoastalDomain::Prvi, false).unwrap(), 0);
        let config = Config::from_file(&output).unwrap();
        assert_eq!(config.model, ModelType::Schism);
        assert_eq!(config.simulation.coastal_domain, CoastalDomain::Prvi);
        assert!(config
            .paths
            .work_dir
            .ends_with("schism_prvi_tpxo_nwm_ana_2021061100"));

        assert!(init_command(&output, ModelType::Schism, CoastalDomain::Prvi, false).is_err());
        assert!(init_command(&output, ModelType::Sfincs, CoastalDomain::Prvi, true).is_ok());
    }
}
