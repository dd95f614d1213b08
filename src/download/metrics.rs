//! Download throughput counters.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by all concurrent downloads of one run.
#[derive(Debug)]
pub struct DownloadMetrics {
    /// Files fetched from the remote store
    pub files_downloaded: AtomicU64,

    /// Files left in place because a non-empty copy existed
    pub files_skipped: AtomicU64,

    /// Files that failed or timed out
    pub files_failed: AtomicU64,

    /// Payload bytes written to disk
    pub bytes_downloaded: AtomicU64,

    /// Time spent in successful fetches (microseconds, summed across tasks)
    pub fetch_us: AtomicU64,

    start_time: Instant,
}

impl DownloadMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files_downloaded: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            fetch_us: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Record a completed fetch.
    pub fn add_download(&self, bytes: u64, duration: Duration) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.fetch_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Throughput in MB/s over the wall-clock lifetime of these counters.
    pub fn throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            fetch_secs: self.fetch_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            elapsed: self.elapsed(),
            throughput_mbps: self.throughput_mbps(),
        }
    }
}

/// Point-in-time copy of [`DownloadMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub files_downloaded: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_downloaded: u64,
    /// Fetch time summed across concurrent tasks
    pub fetch_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub throughput_mbps: f64,
}

impl std::fmt::Display for DownloadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Files: {} downloaded, {} skipped, {} failed | {:.1} MB @ {:.1} MB/s | Elapsed: {:.1}s",
            self.files_downloaded,
            self.files_skipped,
            self.files_failed,
            self.bytes_downloaded as f64 / (1024.0 * 1024.0),
            self.throughput_mbps,
            self.elapsed.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = DownloadMetrics::new();

        metrics.add_download(1000, Duration::from_millis(5));
        metrics.add_download(500, Duration::from_millis(5));
        metrics.add_skipped();
        metrics.add_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.files_downloaded, 2);
        assert_eq!(snapshot.bytes_downloaded, 1500);
        assert_eq!(snapshot.files_skipped, 1);
        assert_eq!(snapshot.files_failed, 1);
        assert!((snapshot.fetch_secs - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes_elapsed_as_seconds() {
        let snapshot = DownloadMetrics::new().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["elapsed"].is_f64());
        assert_eq!(json["files_failed"], 0);
    }
}
