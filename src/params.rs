use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BUCKET_KEY: &str = "s3_bucket";
pub const BUCKET_SECTION: &str = "mlflow";
pub const BUCKET_PLACEHOLDER: &str = "PLACEHOLDER";
pub const DEFAULT_PARAMS_PATH: &str = "params.yaml";

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("failed to read params file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write params file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse params file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("params file {} has no 's3_bucket:' line under 'mlflow:'", path.display())]
    BucketKeyMissing { path: PathBuf },
    #[error(
        "params file {} has {count} 's3_bucket:' lines (lines {lines:?}); expected exactly one",
        path.display()
    )]
    BucketKeyAmbiguous {
        path: PathBuf,
        count: usize,
        lines: Vec<usize>,
    },
    #[error(
        "params file {} changed on disk since it was read; refusing to overwrite",
        path.display()
    )]
    ConcurrentModification { path: PathBuf },
}

/// Typed view over `params.yaml`. Every section is optional so the file can
/// carry keys that only downstream consumers care about.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Params {
    #[serde(default)]
    pub mlflow: Option<MlflowParams>,
    #[serde(default)]
    pub train: Option<TrainParams>,
    #[serde(default)]
    pub model: Option<ModelParams>,
    #[serde(default)]
    pub promote: Option<PromoteParams>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MlflowParams {
    #[serde(default)]
    pub tracking_uri: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainParams {
    pub test_size: f64,
    pub random_state: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelParams {
    pub n_estimators: u32,
    #[serde(default)]
    pub max_depth: Option<u32>,
    pub random_state: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromoteParams {
    pub min_accuracy: f64,
    pub staging_model: PathBuf,
    pub production_model: PathBuf,
}

/// Snapshot of a params file as read from disk. Patches are computed against
/// the snapshot and only written back if the file is still unchanged.
#[derive(Debug, Clone)]
pub struct ParamsFile {
    path: PathBuf,
    contents: String,
}

impl ParamsFile {
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let contents = fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    pub fn from_contents(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn parse(&self) -> Result<Params, ParamsError> {
        if self.contents.trim().is_empty() {
            return Ok(Params::default());
        }
        serde_yaml::from_str(&self.contents).map_err(|source| ParamsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Value of the line `bucket_line` points at, so reads and patches always
    /// agree on which key is the bucket. `None` when the key is absent.
    pub fn bucket(&self) -> Result<Option<String>, ParamsError> {
        self.parse()?;
        match self.bucket_line() {
            Ok(target) => Ok(self.line_value(target)),
            Err(ParamsError::BucketKeyMissing { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Zero-based index of the single bucket line inside the `mlflow:` block.
    pub fn bucket_line(&self) -> Result<usize, ParamsError> {
        let matches = bucket_candidates(&self.contents);

        match matches.as_slice() {
            [] => Err(ParamsError::BucketKeyMissing {
                path: self.path.clone(),
            }),
            [single] => Ok(*single),
            many => Err(ParamsError::BucketKeyAmbiguous {
                path: self.path.clone(),
                count: many.len(),
                lines: many.iter().map(|idx| idx + 1).collect(),
            }),
        }
    }

    /// Render the file with the bucket line rewritten; nothing else changes.
    pub fn with_bucket(&self, bucket: &str) -> Result<String, ParamsError> {
        let target = self.bucket_line()?;
        let mut rendered = String::with_capacity(self.contents.len() + bucket.len());
        for (idx, line) in self.contents.split_inclusive('\n').enumerate() {
            if idx == target {
                rendered.push_str(&rewrite_bucket_line(line, bucket));
            } else {
                rendered.push_str(line);
            }
        }
        Ok(rendered)
    }

    /// Patch the bucket line and replace the file atomically. Returns the
    /// previous value of the key.
    pub fn write_bucket(&mut self, bucket: &str) -> Result<Option<String>, ParamsError> {
        let previous = self.previous_bucket_value()?;
        let rendered = self.with_bucket(bucket)?;

        let on_disk = fs::read_to_string(&self.path).map_err(|source| ParamsError::Read {
            path: self.path.clone(),
            source,
        })?;
        if on_disk != self.contents {
            return Err(ParamsError::ConcurrentModification {
                path: self.path.clone(),
            });
        }

        write_atomic(&self.path, &rendered).map_err(|source| ParamsError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.contents = rendered;
        Ok(previous)
    }

    fn previous_bucket_value(&self) -> Result<Option<String>, ParamsError> {
        let target = self.bucket_line()?;
        Ok(self.line_value(target))
    }

    fn line_value(&self, target: usize) -> Option<String> {
        self.contents
            .split_inclusive('\n')
            .nth(target)
            .and_then(bucket_value)
    }
}

/// Lines holding `s3_bucket:` within the top-level `mlflow:` mapping.
/// Comments and blank lines never end the block.
fn bucket_candidates(contents: &str) -> Vec<usize> {
    let mut in_section = false;
    let mut matches = Vec::new();
    for (idx, line) in contents.split_inclusive('\n').enumerate() {
        let trimmed = line.trim_start();
        if trimmed.trim_end().is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.len() == line.len() {
            in_section = is_key_line(trimmed, BUCKET_SECTION);
            continue;
        }
        if in_section && is_key_line(trimmed, BUCKET_KEY) {
            matches.push(idx);
        }
    }
    matches
}

fn is_key_line(line: &str, key: &str) -> bool {
    line.trim_start()
        .strip_prefix(key)
        .is_some_and(|rest| rest.starts_with(':'))
}

fn bucket_value(line: &str) -> Option<String> {
    let value = line
        .trim_start()
        .strip_prefix(BUCKET_KEY)?
        .strip_prefix(':')?;
    let value = value.split(" #").next().unwrap_or_default().trim();
    let value = value.trim_matches(|c| c == '"' || c == '\'');
    (!value.is_empty()).then(|| value.to_string())
}

fn rewrite_bucket_line(line: &str, bucket: &str) -> String {
    let indent_len = line.len() - line.trim_start().len();
    let indent = &line[..indent_len];
    let terminator = if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    };
    format!("{indent}{BUCKET_KEY}: {bucket}{terminator}")
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_PARAMS_PATH.to_string());
    let temp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    fs::write(&temp, contents)?;
    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }
    Ok(())
}

/// Starter `params.yaml` with the bucket key set to the placeholder.
pub fn params_template() -> String {
    format!(
        "\
mlflow:
  tracking_uri: http://localhost:5000
  experiment_name: mlops-demo
  model_name: iris-classifier
  {BUCKET_KEY}: {BUCKET_PLACEHOLDER}

train:
  test_size: 0.2
  random_state: 42

model:
  n_estimators: 100
  max_depth: 10
  random_state: 42

promote:
  min_accuracy: 0.85
  staging_model: models/staging/model.pkl
  production_model: models/production/model.pkl
"
    )
}
