use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::params::{ParamsError, ParamsFile};
use crate::storage::ObjectStore;

pub const REGION_ENV: &str = "AWS_REGION";
pub const BUCKET_ENV: &str = "MLFLOW_BUCKET";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const BUCKET_PREFIX: &str = "mlflow-artifacts-bucket";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid bucket name '{name}': {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region cannot be empty")]
    EmptyRegion,
    #[error("failed to create bucket '{bucket}' in {region}: {message}")]
    CreateBucket {
        bucket: String,
        region: String,
        message: String,
    },
    #[error("failed to enable versioning on bucket '{bucket}': {message}")]
    EnableVersioning { bucket: String, message: String },
    #[error(transparent)]
    Params(#[from] ParamsError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub region: String,
    pub bucket: String,
}

impl ProvisionRequest {
    /// Flag or environment values win; the defaults fill the rest. Empty
    /// values count as unset.
    pub fn resolve(region: Option<String>, bucket: Option<String>, now: DateTime<Utc>) -> Self {
        let region = non_empty(region).unwrap_or_else(|| DEFAULT_REGION.to_string());
        let bucket = non_empty(bucket).unwrap_or_else(|| next_bucket_name(now));
        Self { region, bucket }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `mlflow-artifacts-bucket-<unix seconds>` for the given instant.
pub fn default_bucket_name(now: DateTime<Utc>) -> String {
    format!("{BUCKET_PREFIX}-{}", now.timestamp())
}

static LAST_TOKEN: Lazy<Mutex<i64>> = Lazy::new(|| Mutex::new(i64::MIN));

/// Like [`default_bucket_name`], but tokens handed out by this process are
/// strictly increasing even when two calls land in the same second.
pub fn next_bucket_name(now: DateTime<Utc>) -> String {
    let mut token = now.timestamp();
    if let Ok(mut last) = LAST_TOKEN.lock() {
        if token <= *last {
            token = *last + 1;
        }
        *last = token;
    }
    format!("{BUCKET_PREFIX}-{token}")
}

/// S3 bucket naming rules for general purpose buckets.
pub fn validate_bucket_name(name: &str) -> Result<(), ProvisionError> {
    let invalid = |reason: &str| ProvisionError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if !(3..=63).contains(&name.len()) {
        return Err(invalid("must be between 3 and 63 characters long"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid(
            "may only contain lowercase letters, digits, hyphens and dots",
        ));
    }
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = name
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(invalid("must start and end with a letter or digit"));
    }
    if name.contains("..") {
        return Err(invalid("must not contain adjacent dots"));
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return Err(invalid("must not be formatted as an IP address"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub bucket: String,
    pub region: String,
    pub params_path: PathBuf,
    pub previous_bucket: Option<String>,
    pub dry_run: bool,
}

/// Create the bucket, turn on versioning, then record the name in the params
/// file. The params file is only touched once both remote steps succeeded.
pub fn provision(
    request: &ProvisionRequest,
    store: &dyn ObjectStore,
    params_path: &Path,
) -> Result<ProvisionOutcome, ProvisionError> {
    let mut params = preflight(request, params_path)?;

    info!(bucket = %request.bucket, region = %request.region, "Creating S3 bucket");
    store
        .create_bucket(&request.bucket, &request.region)
        .map_err(|err| ProvisionError::CreateBucket {
            bucket: request.bucket.clone(),
            region: request.region.clone(),
            message: format!("{err:#}"),
        })?;

    info!(bucket = %request.bucket, "Enabling bucket versioning");
    store
        .enable_versioning(&request.bucket, &request.region)
        .map_err(|err| ProvisionError::EnableVersioning {
            bucket: request.bucket.clone(),
            message: format!("{err:#}"),
        })?;

    info!(params = %params_path.display(), "Recording bucket name");
    let previous_bucket = params.write_bucket(&request.bucket)?;

    info!(
        bucket = %request.bucket,
        region = %request.region,
        previous = previous_bucket.as_deref().unwrap_or("<none>"),
        "Bucket provisioned"
    );

    Ok(ProvisionOutcome {
        bucket: request.bucket.clone(),
        region: request.region.clone(),
        params_path: params_path.to_path_buf(),
        previous_bucket,
        dry_run: false,
    })
}

/// Run every local check `provision` performs without calling the store.
pub fn plan(
    request: &ProvisionRequest,
    params_path: &Path,
) -> Result<ProvisionOutcome, ProvisionError> {
    let params = preflight(request, params_path)?;
    Ok(ProvisionOutcome {
        bucket: request.bucket.clone(),
        region: request.region.clone(),
        params_path: params_path.to_path_buf(),
        previous_bucket: params.bucket().ok().flatten(),
        dry_run: true,
    })
}

fn preflight(request: &ProvisionRequest, params_path: &Path) -> Result<ParamsFile, ProvisionError> {
    if request.region.trim().is_empty() {
        return Err(ProvisionError::EmptyRegion);
    }
    validate_bucket_name(&request.bucket)?;
    let params = ParamsFile::load(params_path)?;
    params.bucket_line()?;
    Ok(params)
}
