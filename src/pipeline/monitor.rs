//! Stage progress tracking and reporting.

use serde::{Serialize, Serializer};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Progress state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub name: String,
    pub status: StageStatus,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Option<Duration>,
    pub substeps: Vec<String>,
    #[serde(skip)]
    started: Option<Instant>,
}

/// Tracks stage progress for one run and reports it through tracing.
#[derive(Debug, Default)]
pub struct WorkflowMonitor {
    stages: Mutex<Vec<StageProgress>>,
}

impl WorkflowMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register stages in execution order.
    pub fn register<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut stages = self.lock();
        for name in names {
            if !stages.iter().any(|s| s.name == name) {
                stages.push(StageProgress {
                    name: name.to_string(),
                    status: StageStatus::Pending,
                    elapsed: None,
                    substeps: Vec::new(),
                    started: None,
                });
            }
        }
    }

    pub fn start(&self, name: &str) {
        let (position, total) = self.update(name, |stage| {
            stage.status = StageStatus::Running;
            stage.started = Some(Instant::now());
        });
        tracing::info!("[{}/{}] Starting stage {}", position, total, name);
    }

    /// Record a progress note for a running stage.
    pub fn substep(&self, name: &str, note: impl Into<String>) {
        let note = note.into();
        tracing::info!("  {}: {}", name, note);
        self.update(name, |stage| stage.substeps.push(note));
    }

    /// Mark a stage finished with `status`.
    pub fn finish(&self, name: &str, status: StageStatus) {
        let mut elapsed = Duration::ZERO;
        self.update(name, |stage| {
            stage.status = status;
            stage.elapsed = stage.started.map(|t| t.elapsed());
            elapsed = stage.elapsed.unwrap_or_default();
        });
        match status {
            StageStatus::Failed => {
                tracing::error!("Stage {} failed after {:.1}s", name, elapsed.as_secs_f64())
            }
            StageStatus::Skipped => tracing::info!("Stage {} skipped", name),
            _ => tracing::info!("Stage {} {:?} in {:.1}s", name, status, elapsed.as_secs_f64()),
        }
    }

    pub fn snapshot(&self) -> Vec<StageProgress> {
        self.lock().clone()
    }

    pub fn status(&self, name: &str) -> Option<StageStatus> {
        self.lock().iter().find(|s| s.name == name).map(|s| s.status)
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let stages = self.snapshot();
        println!("\n=== Workflow Summary ===");
        for stage in &stages {
            let elapsed = stage
                .elapsed
                .map(|d| format!("{:>8.1}s", d.as_secs_f64()))
                .unwrap_or_else(|| format!("{:>9}", "-"));
            println!("{:<22} {:<10} {}", stage.name, format!("{:?}", stage.status), elapsed);
        }
        println!("========================\n");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StageProgress>> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the named stage, registering it if unknown.
    /// Returns its 1-based position and the stage count.
    fn update(&self, name: &str, f: impl FnOnce(&mut StageProgress)) -> (usize, usize) {
        let mut stages = self.lock();
        let index = match stages.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                stages.push(StageProgress {
                    name: name.to_string(),
                    status: StageStatus::Pending,
                    elapsed: None,
                    substeps: Vec::new(),
                    started: None,
                });
                stages.len() - 1
            }
        };
        f(&mut stages[index]);
        (index + 1, stages.len())
    }
}
