//! Stage pipeline: ordered stages, model variants, run environment and progress.

mod environment;
pub mod models;
mod monitor;
mod sequence;
mod stage;
mod stages;

pub use environment::{RunEnvironment, ALLOCATION_VAR};
pub use models::{stage_templates, ModelVariant, StageKind, StageTemplate};
pub use monitor::{StageProgress, StageStatus, WorkflowMonitor};
pub use sequence::{StagePipeline, SubmitPartition};
pub use stage::{Locus, Payload, Stage, StageContext, StageDescriptor};
pub use stages::{DownloadStage, ScriptStage, StageCheck, DEFAULT_MAX_ARTIFACT_BYTES};
