//! Input data acquisition from the NOAA open data buckets.

mod downloader;
mod metrics;
pub mod sources;
mod store;

pub use downloader::{
    DownloadOptions, DownloadRequest, DownloadResult, DownloadResults, DownloadTask, Downloader,
    TaskStatus,
};
pub use metrics::{DownloadMetrics, DownloadSnapshot};
pub use sources::{DataKind, SourceId, TimeRange};
pub use store::{create_anonymous_store, StoreRegistry, DEFAULT_REGION};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Requested dates fall entirely outside a source's publication window.
    #[error("requested dates are not available:\n  - {}", .0.join("\n  - "))]
    InvalidDateRange(Vec<String>),

    /// Some files failed while `raise_on_error` was set.
    #[error("{count} of {total} downloads failed:\n  - {}", .failures.join("\n  - "))]
    Failed {
        count: usize,
        total: usize,
        failures: Vec<String>,
        results: Box<DownloadResults>,
    },
}
