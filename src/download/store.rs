//! Object store clients for the public NOAA buckets.
//!
//! Every bucket gets its own anonymous S3 client, created on first use and
//! shared by all downloads against that bucket.

use anyhow::Result;
use object_store::aws::AmazonS3Builder;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Region hosting the NOAA open data buckets.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Client options for many moderately sized NetCDF downloads.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        // Per-request limit; the downloader applies its own per-file timeout on top
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(32)
        .with_http2_keep_alive_interval(Duration::from_secs(15))
        .with_http2_keep_alive_while_idle()
}

/// Retry configuration for throttling and transient server errors.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// Create an anonymous S3 client for a public bucket.
pub fn create_anonymous_store(bucket: &str, region: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::debug!("Creating anonymous S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config())
        .with_skip_signature(true);

    Ok(Arc::new(builder.build()?))
}

/// Bucket name to client mapping.
pub struct StoreRegistry {
    region: String,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl StoreRegistry {
    /// Registry creating anonymous S3 clients in `region` on demand.
    pub fn anonymous(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pre-built store for `bucket`.
    pub fn with_store(self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.into(), store);
        self
    }

    /// Store serving `bucket`, created on first request.
    pub fn get(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }
        let store = create_anonymous_store(bucket, &self.region)?;
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::anonymous(DEFAULT_REGION)
    }
}
