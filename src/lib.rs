//! Coastal model calibration workflow
//!
//! Resolves a layered run configuration, fetches model inputs from public
//! NOAA buckets, and drives the SCHISM or SFINCS stage sequence either in
//! this process or through a SLURM batch job.
//!
//! # Architecture
//!
//! - **Config**: `_base` inheritance, deep merge, `${section.field}`
//!   interpolation and templated default paths
//! - **Download**: date-window validation per source and bounded concurrent
//!   fetches using object_store
//! - **Pipeline**: named stages with a locus, model variants and the run
//!   environment handed to stage scripts
//! - **Scheduler**: SLURM submission, state polling and job scripts
//! - **Orchestrator**: stage selection, fail-fast execution and run results
//!
//! # Usage
//!
//! ```no_run
//! use coastal_calib::{Orchestrator, RunOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::from_path("config.yaml".as_ref())?;
//!     let result = orchestrator.run(&RunOptions::default());
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;

pub use config::{Config, ModelType};
pub use download::{DownloadError, DownloadResults, Downloader};
pub use error::{Error, FailureKind, Result};
pub use orchestrator::{
    run_workflow, submit_workflow, Orchestrator, RunOptions, StageResult, SubmitOptions,
    WorkflowResult,
};
pub use pipeline::{Locus, StageDescriptor, StagePipeline};
pub use scheduler::{JobState, SchedulerClient, SlurmClient};

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
