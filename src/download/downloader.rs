//! Concurrent acquisition of forcing, streamflow and boundary files.

use super::metrics::{DownloadMetrics, DownloadSnapshot};
use super::sources::{
    clip_to_availability, meteo_file, stofs_file, streamflow_file, DataKind, RemoteFile, SourceId,
    TimeRange,
};
use super::store::StoreRegistry;
use super::DownloadError;
use crate::config::{BoundarySource, CoastalDomain, Config, DownloadConfig, MeteoSource};
use anyhow::Context;
use chrono::NaiveDateTime;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use object_store::ObjectStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to fetch.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Inclusive range of valid times
    pub range: TimeRange,
    pub domain: CoastalDomain,
    /// Meteorological product; streamflow comes from the same product
    pub meteo: MeteoSource,
    pub coastal: BoundarySource,
    /// Root of the local raw data tree
    pub output_dir: PathBuf,
}

impl DownloadRequest {
    /// Request covering the whole simulation window of `config`.
    pub fn from_config(config: &Config) -> Self {
        let sim = &config.simulation;
        Self {
            range: TimeRange::new(sim.start_date, sim.end_date()),
            domain: sim.coastal_domain,
            meteo: sim.meteo_source,
            coastal: config.boundary.source,
            output_dir: config.paths.raw_download_dir.clone(),
        }
    }
}

/// How to fetch.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub skip_existing: bool,
    /// Limit for one file, request and write included
    pub timeout: Duration,
    pub raise_on_error: bool,
    pub concurrency_per_host: usize,
}

impl From<&DownloadConfig> for DownloadOptions {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            skip_existing: config.skip_existing,
            timeout: Duration::from_secs(config.timeout_secs),
            raise_on_error: config.raise_on_error,
            concurrency_per_host: config.concurrency_per_host.max(1),
        }
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self::from(&DownloadConfig::default())
    }
}

/// Outcome of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloaded,
    SkippedExisting,
    Failed(String),
}

/// One file to fetch.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub kind: DataKind,
    pub source: SourceId,
    pub valid_time: NaiveDateTime,
    #[serde(flatten)]
    pub remote: RemoteFile,
    pub status: TaskStatus,
}

/// Tally for one data kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadResult {
    pub source: String,
    pub total_files: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub file_paths: Vec<PathBuf>,
}

impl DownloadResult {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, task: &DownloadTask) {
        self.total_files += 1;
        match &task.status {
            TaskStatus::Downloaded => {
                self.successful += 1;
                self.file_paths.push(task.remote.destination.clone());
            }
            TaskStatus::SkippedExisting => {
                self.skipped += 1;
                self.file_paths.push(task.remote.destination.clone());
            }
            TaskStatus::Failed(message) => {
                self.failed += 1;
                self.errors.push(message.clone());
            }
            TaskStatus::Pending => {}
        }
    }
}

/// Tallies for every data kind of one download run.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResults {
    pub meteo: DownloadResult,
    pub hydro: DownloadResult,
    pub coastal: DownloadResult,
    pub metrics: Option<DownloadSnapshot>,
}

impl DownloadResults {
    fn kinds(&self) -> [&DownloadResult; 3] {
        [&self.meteo, &self.hydro, &self.coastal]
    }

    pub fn total_files(&self) -> usize {
        self.kinds().iter().map(|r| r.total_files).sum()
    }

    pub fn successful(&self) -> usize {
        self.kinds().iter().map(|r| r.successful).sum()
    }

    pub fn skipped(&self) -> usize {
        self.kinds().iter().map(|r| r.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.kinds().iter().map(|r| r.failed).sum()
    }

    /// Every failure message, in kind order.
    pub fn failures(&self) -> Vec<String> {
        self.kinds()
            .iter()
            .flat_map(|r| r.errors.iter().cloned())
            .collect()
    }
}

impl fmt::Display for DownloadResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files: {} downloaded, {} skipped, {} failed (meteo {}/{}, hydro {}/{}, coastal {}/{})",
            self.total_files(),
            self.successful(),
            self.skipped(),
            self.failed(),
            self.meteo.successful + self.meteo.skipped,
            self.meteo.total_files,
            self.hydro.successful + self.hydro.skipped,
            self.hydro.total_files,
            self.coastal.successful + self.coastal.skipped,
            self.coastal.total_files,
        )
    }
}

/// Fetches input files with bounded per-host concurrency.
pub struct Downloader {
    stores: StoreRegistry,
    options: DownloadOptions,
    metrics: Arc<DownloadMetrics>,
}

impl Downloader {
    pub fn new(stores: StoreRegistry, options: DownloadOptions) -> Self {
        Self {
            stores,
            options,
            metrics: DownloadMetrics::new(),
        }
    }

    pub fn metrics(&self) -> Arc<DownloadMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Validate the request against source availability and enumerate tasks.
    ///
    /// Fails closed: any kind whose range lies entirely outside its source's
    /// window rejects the whole request.
    pub fn plan(&self, request: &DownloadRequest) -> Result<Vec<DownloadTask>, DownloadError> {
        let meteo_source = SourceId::from(request.meteo);
        let mut errors = Vec::new();
        let mut tasks = Vec::new();

        for kind in [DataKind::Meteo, DataKind::Hydro] {
            match clip_to_availability(meteo_source, kind, request.domain, request.range) {
                Ok(range) => {
                    for time in range.hours() {
                        let remote = match kind {
                            DataKind::Meteo => {
                                meteo_file(&request.output_dir, request.meteo, request.domain, time)
                            }
                            _ => streamflow_file(
                                &request.output_dir,
                                request.meteo,
                                request.domain,
                                time,
                            ),
                        };
                        tasks.push(DownloadTask {
                            kind,
                            source: meteo_source,
                            valid_time: time,
                            remote,
                            status: TaskStatus::Pending,
                        });
                    }
                }
                Err(message) => errors.push(message),
            }
        }

        // TPXO is a local atlas; only STOFS is fetched
        if request.coastal == BoundarySource::Stofs {
            match clip_to_availability(SourceId::Stofs, DataKind::Coastal, request.domain, request.range) {
                Ok(range) => tasks.push(DownloadTask {
                    kind: DataKind::Coastal,
                    source: SourceId::Stofs,
                    valid_time: range.start,
                    remote: stofs_file(&request.output_dir, request.range.start),
                    status: TaskStatus::Pending,
                }),
                Err(message) => errors.push(message),
            }
        }

        if errors.is_empty() {
            Ok(tasks)
        } else {
            Err(DownloadError::InvalidDateRange(errors))
        }
    }

    /// Fetch every file of `request`.
    ///
    /// Returns per-kind tallies. With `raise_on_error` any failed file turns
    /// the run into a [`DownloadError::Failed`] that still carries the tallies.
    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadResults, DownloadError> {
        let tasks = self.plan(request)?;

        let mut by_bucket: BTreeMap<&'static str, Vec<DownloadTask>> = BTreeMap::new();
        for task in tasks {
            by_bucket.entry(task.remote.bucket).or_default().push(task);
        }

        tracing::info!(
            "Downloading {} for {} ({}) from {} bucket(s)",
            request.range,
            request.domain,
            request.meteo,
            by_bucket.len()
        );

        let limit = self.options.concurrency_per_host.max(1);
        let groups = by_bucket.into_iter().map(|(bucket, tasks)| async move {
            let store = match self.stores.get(bucket) {
                Ok(store) => store,
                Err(e) => {
                    let message = format!("{bucket}: cannot create client: {e}");
                    return tasks
                        .into_iter()
                        .map(|mut task| {
                            self.metrics.add_failure();
                            task.status = TaskStatus::Failed(message.clone());
                            task
                        })
                        .collect::<Vec<_>>();
                }
            };

            stream::iter(tasks)
                .map(|task| {
                    let store = Arc::clone(&store);
                    async move { self.fetch(store, task).await }
                })
                .buffer_unordered(limit)
                .collect::<Vec<_>>()
                .await
        });
        let finished: Vec<DownloadTask> = join_all(groups).await.into_iter().flatten().collect();

        let mut results = DownloadResults {
            meteo: DownloadResult::new(request.meteo.as_str()),
            hydro: DownloadResult::new(request.meteo.as_str()),
            coastal: DownloadResult::new(request.coastal.as_str()),
            metrics: None,
        };
        let mut ordered = finished;
        ordered.sort_by(|a, b| (a.kind, a.valid_time).cmp(&(b.kind, b.valid_time)));
        for task in &ordered {
            match task.kind {
                DataKind::Meteo => results.meteo.record(task),
                DataKind::Hydro => results.hydro.record(task),
                DataKind::Coastal => results.coastal.record(task),
            }
        }
        results.metrics = Some(self.metrics.snapshot());

        tracing::info!("Download finished: {}", results);
        for failure in results.failures() {
            tracing::warn!("Download failed: {}", failure);
        }

        let failed = results.failed();
        if failed > 0 && self.options.raise_on_error {
            return Err(DownloadError::Failed {
                count: failed,
                total: results.total_files(),
                failures: results.failures(),
                results: Box::new(results),
            });
        }
        Ok(results)
    }

    async fn fetch(&self, store: Arc<dyn ObjectStore>, mut task: DownloadTask) -> DownloadTask {
        let destination = &task.remote.destination;

        if self.options.skip_existing && is_non_empty(destination).await {
            tracing::debug!("Skipping existing {}", destination.display());
            self.metrics.add_skipped();
            task.status = TaskStatus::SkippedExisting;
            return task;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.options.timeout,
            fetch_to_file(store.as_ref(), &task.remote.key, destination),
        )
        .await;

        task.status = match outcome {
            Ok(Ok(bytes)) => {
                self.metrics.add_download(bytes, started.elapsed());
                TaskStatus::Downloaded
            }
            Ok(Err(e)) => {
                self.metrics.add_failure();
                TaskStatus::Failed(format!("{}/{}: {:#}", task.remote.bucket, task.remote.key, e))
            }
            Err(_) => {
                self.metrics.add_failure();
                discard_partial(destination).await;
                TaskStatus::Failed(format!(
                    "{}/{}: timed out after {}s",
                    task.remote.bucket,
                    task.remote.key,
                    self.options.timeout.as_secs()
                ))
            }
        };
        task
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn discard_partial(destination: &Path) {
    let _ = tokio::fs::remove_file(partial_path(destination)).await;
}

/// Fetch one object into a temporary sibling, then move it into place.
async fn fetch_to_file(store: &dyn ObjectStore, key: &str, destination: &Path) -> anyhow::Result<u64> {
    let location = object_store::path::Path::from(key);
    let data = store.get(&location).await?.bytes().await?;

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let partial = partial_path(destination);
    if let Err(e) = tokio::fs::write(&partial, &data).await {
        discard_partial(destination).await;
        return Err(e).with_context(|| format!("writing {}", partial.display()));
    }
    tokio::fs::rename(&partial, destination)
        .await
        .with_context(|| format!("moving {} into place", partial.display()))?;

    Ok(data.len() as u64)
}
